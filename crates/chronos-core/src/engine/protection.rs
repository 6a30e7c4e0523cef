//! Volume protection while an alarm session is audible.
//!
//! Started by the lifecycle controller when a session begins and stopped
//! when it ends. While running it re-reads the output level every period
//! and forces it back to maximum whenever it drops below the floor. On stop
//! the pre-session level is restored if the loop ever changed it.
//!
//! The periodic task runs on the ambient tokio runtime. Without one (plain
//! synchronous callers) only the initial enforcement pass happens; callers
//! can drive further passes with [`ProtectionLoop::enforce`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::collaborators::VolumeControl;

pub const MAX_LEVEL: f32 = 1.0;

#[derive(Debug, Clone)]
pub struct ProtectionSettings {
    pub volume_override: bool,
    pub period: Duration,
    /// Levels strictly below this are reset to [`MAX_LEVEL`].
    pub floor: f32,
}

impl Default for ProtectionSettings {
    fn default() -> Self {
        Self {
            volume_override: false,
            period: Duration::from_millis(500),
            floor: MAX_LEVEL,
        }
    }
}

#[derive(Debug)]
struct Restore {
    original: f32,
    overridden: bool,
}

struct Active {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    // The periodic task enforces and `stop` restores under this lock, so no
    // enforcement can land after the restore.
    restore: Arc<Mutex<Restore>>,
}

pub struct ProtectionLoop {
    volume: Arc<dyn VolumeControl>,
    settings: ProtectionSettings,
    active: Option<Active>,
}

impl ProtectionLoop {
    pub fn new(volume: Arc<dyn VolumeControl>, settings: ProtectionSettings) -> Self {
        Self {
            volume,
            settings,
            active: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    pub fn settings(&self) -> &ProtectionSettings {
        &self.settings
    }

    /// Begin protecting. No-op when disabled or already running.
    pub fn start(&mut self) {
        if !self.settings.volume_override || self.active.is_some() {
            return;
        }

        let restore = Arc::new(Mutex::new(Restore {
            original: self.volume.level(),
            overridden: false,
        }));
        {
            let mut guard = restore.lock().unwrap_or_else(|e| e.into_inner());
            enforce_once(self.volume.as_ref(), self.settings.floor, &mut guard);
        }

        let token = CancellationToken::new();
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(rt) => Some(rt.spawn(protection_loop(
                self.volume.clone(),
                restore.clone(),
                self.settings.clone(),
                token.clone(),
            ))),
            Err(_) => {
                debug!("no async runtime; volume protection runs on explicit passes only");
                None
            }
        };

        info!(period_ms = self.settings.period.as_millis() as u64, "volume protection on");
        self.active = Some(Active {
            token,
            handle,
            restore,
        });
    }

    /// One enforcement pass. Returns whether the level was reset.
    pub fn enforce(&self) -> bool {
        let Some(active) = &self.active else {
            return false;
        };
        locked_pass(&active.restore, self.volume.as_ref(), self.settings.floor, &active.token)
            .unwrap_or(false)
    }

    /// Stop protecting and restore the pre-session level. Safe to repeat.
    pub fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.token.cancel();
        if let Some(handle) = active.handle {
            handle.abort();
        }
        let guard = active.restore.lock().unwrap_or_else(|e| e.into_inner());
        if guard.overridden {
            self.volume.set_level(guard.original);
        }
        info!(restored = guard.overridden, "volume protection off");
    }
}

impl Drop for ProtectionLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn enforce_once(volume: &dyn VolumeControl, floor: f32, restore: &mut Restore) -> bool {
    let level = volume.level();
    if level < floor {
        volume.set_level(MAX_LEVEL);
        restore.overridden = true;
        debug!(level, "volume below floor, reset to max");
        true
    } else {
        false
    }
}

/// Enforce under the restore lock. `None` once the token is cancelled.
fn locked_pass(
    restore: &Mutex<Restore>,
    volume: &dyn VolumeControl,
    floor: f32,
    token: &CancellationToken,
) -> Option<bool> {
    let mut guard = restore.lock().unwrap_or_else(|e| e.into_inner());
    if token.is_cancelled() {
        return None;
    }
    Some(enforce_once(volume, floor, &mut guard))
}

async fn protection_loop(
    volume: Arc<dyn VolumeControl>,
    restore: Arc<Mutex<Restore>>,
    settings: ProtectionSettings,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(settings.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if locked_pass(&restore, volume.as_ref(), settings.floor, &token).is_none() {
                    break;
                }
            }
            _ = token.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::collaborators::SoftwareVolume;

    fn settings(enabled: bool) -> ProtectionSettings {
        ProtectionSettings {
            volume_override: enabled,
            period: Duration::from_millis(10),
            floor: MAX_LEVEL,
        }
    }

    #[test]
    fn disabled_loop_never_touches_volume() {
        let volume = Arc::new(SoftwareVolume::new(0.2));
        let mut guard = ProtectionLoop::new(volume.clone(), settings(false));
        guard.start();
        assert!(!guard.is_running());
        assert_eq!(volume.level(), 0.2);
    }

    #[test]
    fn start_raises_and_stop_restores_without_runtime() {
        let volume = Arc::new(SoftwareVolume::new(0.3));
        let mut guard = ProtectionLoop::new(volume.clone(), settings(true));
        guard.start();
        assert!(guard.is_running());
        assert_eq!(volume.level(), MAX_LEVEL);

        volume.set_level(0.1);
        assert!(guard.enforce());
        assert_eq!(volume.level(), MAX_LEVEL);

        guard.stop();
        assert!(!guard.is_running());
        assert_eq!(volume.level(), 0.3);
        assert!(!guard.enforce());
    }

    #[test]
    fn untouched_level_is_not_restored() {
        let volume = Arc::new(SoftwareVolume::new(1.0));
        let mut guard = ProtectionLoop::new(volume.clone(), settings(true));
        guard.start();
        // Someone else lowers it after protection stopped; we must not undo that.
        guard.stop();
        volume.set_level(0.4);
        guard.stop();
        assert_eq!(volume.level(), 0.4);
    }

    #[tokio::test]
    async fn periodic_task_reclamps_until_stopped() {
        let volume = Arc::new(SoftwareVolume::new(0.5));
        let mut guard = ProtectionLoop::new(volume.clone(), settings(true));
        guard.start();
        assert_eq!(volume.level(), MAX_LEVEL);

        volume.set_level(0.0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(volume.level(), MAX_LEVEL);

        guard.stop();
        assert_eq!(volume.level(), 0.5);

        // Nothing re-clamps once stopped.
        volume.set_level(0.2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(volume.level(), 0.2);
    }
}
