//! Async driver for the dispatcher.
//!
//! The engine itself is synchronous. This module ticks it from a tokio
//! interval and forwards the resulting events over a channel. Every
//! transition goes through the one `tokio::sync::Mutex` around the engine,
//! which is also what external commands lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{AlarmEngine, Clock};
use crate::events::Event;

pub type SharedEngine = Arc<Mutex<AlarmEngine>>;

pub struct DispatcherTask {
    handle: Option<JoinHandle<()>>,
    token: CancellationToken,
}

impl DispatcherTask {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Cancel the loop and wait for it to exit. Returns `false` when the
    /// loop had died (panicked or aborted) instead of stopping cleanly.
    pub async fn stop(&mut self) -> bool {
        self.token.cancel();
        let Some(handle) = self.handle.take() else {
            return true;
        };
        match handle.await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "dispatcher loop did not exit cleanly");
                false
            }
        }
    }
}

/// Tick `engine` every `interval` until `token` is cancelled.
///
/// Events go to `events` when given; a closed receiver is not an error.
pub fn spawn_dispatcher(
    engine: SharedEngine,
    clock: Arc<dyn Clock>,
    interval: Duration,
    events: Option<mpsc::UnboundedSender<Event>>,
    token: CancellationToken,
) -> DispatcherTask {
    let handle = tokio::spawn(dispatcher_loop(engine, clock, interval, events, token.clone()));
    DispatcherTask {
        handle: Some(handle),
        token,
    }
}

async fn dispatcher_loop(
    engine: SharedEngine,
    clock: Arc<dyn Clock>,
    interval: Duration,
    events: Option<mpsc::UnboundedSender<Event>>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_ms = interval.as_millis() as u64, "dispatcher started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = clock.now();
                let produced = engine.lock().await.tick(now);
                if !produced.is_empty() {
                    debug!(count = produced.len(), %now, "tick produced events");
                }
                if let Some(tx) = &events {
                    for event in produced {
                        let _ = tx.send(event);
                    }
                }
            }
            _ = token.cancelled() => {
                info!("dispatcher stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{AlarmDefinition, DaySet};
    use crate::storage::EngineSettings;
    use crate::testing::{monday_at as at, Fakes, ManualClock};

    #[tokio::test]
    async fn ticks_until_cancelled() {
        let fakes = Fakes::new();
        let def = AlarmDefinition::new(7, 0, DaySet::EMPTY).unwrap();
        fakes.store.insert(def.clone());

        let engine = Arc::new(Mutex::new(AlarmEngine::new(
            fakes.collaborators(),
            &EngineSettings::default(),
        )));
        let clock = Arc::new(ManualClock::new(at(7, 0, 0)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut task = spawn_dispatcher(
            engine.clone(),
            clock.clone(),
            Duration::from_millis(5),
            Some(tx),
            CancellationToken::new(),
        );

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Event::AlarmFired { ref alarm_id, .. } if *alarm_id == def.id));

        // Commands take the same lock as the loop.
        engine.lock().await.dismiss(clock.now());
        assert!(engine.lock().await.state().session().is_none());

        assert!(task.stop().await);
        assert!(task.is_finished());
    }

    struct PanickingClock;

    impl Clock for PanickingClock {
        fn now(&self) -> chrono::NaiveDateTime {
            panic!("clock unavailable")
        }
    }

    #[tokio::test]
    async fn stop_reports_a_dead_loop() {
        let fakes = Fakes::new();
        let engine = Arc::new(Mutex::new(AlarmEngine::new(
            fakes.collaborators(),
            &EngineSettings::default(),
        )));
        let mut task = spawn_dispatcher(
            engine,
            Arc::new(PanickingClock),
            Duration::from_millis(5),
            None,
            CancellationToken::new(),
        );

        while !task.is_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!task.stop().await);
    }
}
