//! Bounded automatic relaunch after a crash.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

/// Relaunch attempts allowed before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Pause before each relaunch.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// What to do about a crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDecision {
    Relaunch { model_path: PathBuf, delay: Duration },
    GiveUp { reason: String },
}

/// Crash counter for the current model.
#[derive(Debug, Clone)]
pub struct CrashRecovery {
    crash_count: u32,
    max_retries: u32,
    backoff: Duration,
    last_known_model_path: Option<PathBuf>,
}

impl CrashRecovery {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            crash_count: 0,
            max_retries,
            backoff,
            last_known_model_path: None,
        }
    }

    pub fn crash_count(&self) -> u32 {
        self.crash_count
    }

    pub fn last_known_model_path(&self) -> Option<&Path> {
        self.last_known_model_path.as_deref()
    }

    /// A caller asked for `model_path`: start counting from zero for it.
    pub fn begin_explicit_load(&mut self, model_path: &Path) {
        self.crash_count = 0;
        self.last_known_model_path = Some(model_path.to_path_buf());
    }

    /// The server reached `Ready`.
    pub fn on_ready(&mut self) {
        if self.crash_count > 0 {
            info!("Server recovered after {} crash(es)", self.crash_count);
        }
        self.crash_count = 0;
    }

    /// Record a crash and decide whether to relaunch.
    pub fn on_crash(&mut self) -> RecoveryDecision {
        self.crash_count = self.crash_count.saturating_add(1);

        let Some(model_path) = self.last_known_model_path.clone() else {
            return RecoveryDecision::GiveUp {
                reason: "server crashed and no model is known to reload".to_string(),
            };
        };

        if self.crash_count > self.max_retries {
            warn!(
                "Giving up after {} crashes of {}",
                self.crash_count,
                model_path.display()
            );
            return RecoveryDecision::GiveUp {
                reason: format!(
                    "server crashed {} times; retries exhausted (max {})",
                    self.crash_count, self.max_retries
                ),
            };
        }

        info!(
            "Relaunching {} in {:?} (attempt {}/{})",
            model_path.display(),
            self.backoff,
            self.crash_count,
            self.max_retries
        );
        RecoveryDecision::Relaunch {
            model_path,
            delay: self.backoff,
        }
    }
}

impl Default for CrashRecovery {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF)
    }
}
