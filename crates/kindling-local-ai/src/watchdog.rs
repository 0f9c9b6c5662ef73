//! Background liveness monitor for one launch of llama-server.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::process::pid_is_alive;

/// Default time between liveness checks.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);

/// What the watchdog found when it looked at its process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessCheck {
    Running,
    /// The process exited; carries the exit description.
    Exited(String),
    /// The supervisor no longer holds this launch (stopped or replaced).
    Released,
}

/// The supervisor side of the watchdog.
///
/// Every call names the launch generation the watchdog was started for, so a
/// watchdog that outlives its launch cannot act on a newer process.
#[async_trait]
pub trait Supervised: Send + Sync + 'static {
    async fn check_process(&self, generation: u64) -> ProcessCheck;

    /// The process of `generation` exited on its own.
    async fn process_exited(&self, generation: u64, status: String);

    /// The owning application is gone; the child must not outlive it.
    async fn owner_gone(&self, generation: u64);
}

/// Start watching launch `generation`.
///
/// The task ends when `cancel` turns `true` (or its sender is dropped), when
/// the launch is released or the supervisor is dropped, or after reporting an
/// exit or a missing owner.
pub fn spawn_watchdog<S: Supervised>(
    target: Weak<S>,
    generation: u64,
    interval: Duration,
    owner_pid: Option<u32>,
    mut cancel: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Watchdog started for launch {}", generation);
        loop {
            if *cancel.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = cancel.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let Some(target) = target.upgrade() else {
                break;
            };

            // Crash handling below runs to completion even if a stop arrives
            // meanwhile; the supervisor serialises both through the slot.
            if let Some(pid) = owner_pid {
                if !pid_is_alive(pid) {
                    warn!("Owner process {} is gone, killing llama-server", pid);
                    target.owner_gone(generation).await;
                    break;
                }
            }

            match target.check_process(generation).await {
                ProcessCheck::Running => {}
                ProcessCheck::Released => break,
                ProcessCheck::Exited(status) => {
                    warn!("llama-server exited unexpectedly: {}", status);
                    target.process_exited(generation, status).await;
                    break;
                }
            }
        }
        debug!("Watchdog stopped for launch {}", generation);
    })
}
