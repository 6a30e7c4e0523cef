//! Foreground daemon.
//!
//! Ticks the engine on the configured interval, prints every event as one
//! JSON line on stdout and reads control commands, one per line, on stdin.
//! Audio, challenges and emergency actions are log-only.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use chronos_core::engine::{AlarmEngine, Clock, SystemClock};
use chronos_core::error::ChallengeError;
use chronos_core::runtime::{spawn_dispatcher, SharedEngine};
use chronos_core::{Config, Event};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::open_engine;

#[derive(Args)]
pub struct RunArgs {
    /// Override dispatcher.tick_interval_ms
    #[arg(long)]
    pub interval_ms: Option<u64>,
    /// Skip boot reconciliation
    #[arg(long)]
    pub no_recover: bool,
}

/// A line on the control channel.
#[derive(Debug, PartialEq, Eq)]
pub enum ControlCommand {
    Complete(String),
    Fail(String, String),
    Dismiss,
    Confirm,
    Toggle(String),
    Delete(String),
    Cancel(String),
    Wake(String),
    Status,
    Quit,
}

impl ControlCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or("empty command")?;
        let mut arg = |what: &str| {
            words
                .next()
                .map(str::to_string)
                .ok_or_else(|| format!("{verb}: missing {what}"))
        };
        let cmd = match verb {
            "complete" | "solve" => Self::Complete(arg("challenge id")?),
            "fail" => {
                let id = arg("challenge id")?;
                let reason: Vec<&str> = words.collect();
                Self::Fail(id, reason.join(" "))
            }
            "dismiss" => Self::Dismiss,
            "confirm" => Self::Confirm,
            "toggle" => Self::Toggle(arg("alarm id")?),
            "delete" => Self::Delete(arg("alarm id")?),
            "cancel" => Self::Cancel(arg("alarm id")?),
            "wake" => Self::Wake(arg("alarm id")?),
            "status" => Self::Status,
            "quit" | "exit" => Self::Quit,
            other => return Err(format!("unknown command '{other}'")),
        };
        Ok(cmd)
    }
}

pub fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let engine = open_engine(&config)?;
    let interval = args
        .interval_ms
        .map(|ms| Duration::from_millis(ms.max(1)))
        .unwrap_or_else(|| config.tick_interval());
    let recover = config.recover_on_start && !args.no_recover;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(daemon(engine, interval, recover))
}

async fn daemon(
    mut engine: AlarmEngine,
    interval: Duration,
    recover: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    if recover {
        for (id, at) in engine.recover(clock.now()) {
            info!(alarm_id = %id, next = %at, "armed");
        }
    }

    let engine: SharedEngine = Arc::new(Mutex::new(engine));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let token = CancellationToken::new();
    let mut task = spawn_dispatcher(engine.clone(), clock.clone(), interval, Some(tx), token.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            Some(event) = rx.recv() => emit(&event),
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match ControlCommand::parse(&line) {
                    Ok(ControlCommand::Quit) => break,
                    Ok(cmd) => {
                        let mut guard = engine.lock().await;
                        for event in apply(&mut guard, cmd, clock.now()) {
                            emit(&event);
                        }
                    }
                    Err(e) => warn!(error = %e, "bad control command"),
                },
                Ok(None) => {
                    info!("stdin closed; running until interrupted");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "stdin read failed; control channel closed");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    task.stop().await;
    while let Ok(event) = rx.try_recv() {
        emit(&event);
    }
    Ok(())
}

fn apply(engine: &mut AlarmEngine, cmd: ControlCommand, now: chrono::NaiveDateTime) -> Vec<Event> {
    let result = match cmd {
        ControlCommand::Complete(id) => Ok(engine.complete_challenge(&id, now)),
        ControlCommand::Fail(id, reason) => Ok(engine.fail_challenge(
            &id,
            &ChallengeError::Other(reason),
            now,
        )),
        ControlCommand::Dismiss => Ok(engine.dismiss(now)),
        ControlCommand::Confirm => Ok(engine.confirm_wake_up(now)),
        ControlCommand::Toggle(id) => engine.toggle_alarm(&id, now),
        ControlCommand::Delete(id) => engine.delete_alarm(&id, now),
        ControlCommand::Cancel(id) => Ok(engine.cancel_alarm(&id, now)),
        ControlCommand::Wake(id) => Ok(engine.on_wake(&id, now)),
        ControlCommand::Status => Ok(vec![engine.snapshot(now)]),
        ControlCommand::Quit => Ok(Vec::new()),
    };
    result.unwrap_or_else(|e| {
        warn!(error = %e, "command failed");
        Vec::new()
    })
}

fn emit(event: &Event) {
    match serde_json::to_string(event) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(error = %e, "failed to encode event"),
    }
}
