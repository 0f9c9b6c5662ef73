//! Deciding when a freshly launched llama-server can take requests.
//!
//! A listening socket is not enough: `/v1/models` can list the model while
//! the weights are still loading, and completions answer 503 until they are
//! in memory. The prober therefore requires a non-empty model list followed
//! by a one-token canary completion that is not refused as "loading".

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info};

use crate::client::LlamaCppClient;
use crate::error::LocalAIError;

/// Default time between probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default overall startup deadline.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Status llama-server uses while the model is still loading.
const STATUS_LOADING: u16 = 503;

/// Liveness of the process being probed.
#[async_trait]
pub trait ProcessLiveness: Send + Sync {
    /// `None` while the process runs, a description of how it ended otherwise.
    async fn exit_status(&self) -> Option<String>;
}

/// Which canary answers count as "model loaded".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CanaryPolicy {
    /// Anything except 503. Some builds reject the tiny canary with 4xx/5xx
    /// even though the model is loaded.
    #[default]
    AnyNon503,
    /// Only 200 counts.
    Strict200,
}

impl CanaryPolicy {
    pub fn is_loaded(self, status: u16) -> bool {
        match self {
            CanaryPolicy::AnyNon503 => status != STATUS_LOADING,
            CanaryPolicy::Strict200 => status == 200,
        }
    }
}

/// Polls a server until it is ready, dead, cancelled or out of time.
#[derive(Clone)]
pub struct ReadinessProber {
    client: LlamaCppClient,
    poll_interval: Duration,
    timeout: Duration,
    canary_policy: CanaryPolicy,
}

impl ReadinessProber {
    pub fn new(client: LlamaCppClient) -> Self {
        Self {
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_STARTUP_TIMEOUT,
            canary_policy: CanaryPolicy::default(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_canary_policy(mut self, policy: CanaryPolicy) -> Self {
        self.canary_policy = policy;
        self
    }

    /// Wait until the server is ready.
    ///
    /// Liveness is checked before every probe, so a process that dies during
    /// startup fails fast instead of running into the timeout. Setting
    /// `cancel` to `true` aborts the wait.
    pub async fn await_ready(
        &self,
        liveness: &dyn ProcessLiveness,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), LocalAIError> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut last_error: Option<String> = None;
        let mut attempts = 0u32;

        loop {
            if *cancel.borrow() {
                return Err(LocalAIError::Cancelled);
            }
            if let Some(status) = liveness.exit_status().await {
                return Err(LocalAIError::ProcessTerminatedUnexpectedly(status));
            }
            if Instant::now() >= deadline {
                return Err(timed_out(last_error));
            }

            attempts += 1;
            let probe = timeout_at(deadline, self.probe_once());
            let outcome = tokio::select! {
                outcome = probe => outcome,
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Err(LocalAIError::Cancelled);
                    }
                    continue;
                }
            };

            match outcome {
                Ok(Ok(())) => {
                    info!(
                        "Server ready after {:.1}s ({} probes)",
                        started.elapsed().as_secs_f32(),
                        attempts
                    );
                    return Ok(());
                }
                Ok(Err(diagnostic)) => {
                    debug!("Not ready yet: {}", diagnostic);
                    last_error = Some(diagnostic);
                }
                // A cut-off probe says nothing new; keep the earlier diagnostic.
                Err(_) => {
                    last_error.get_or_insert_with(|| {
                        "probe did not finish before the deadline".to_string()
                    });
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out(last_error));
            }

            tokio::select! {
                _ = sleep(self.poll_interval.min(remaining)) => {}
                changed = cancel.changed() => {
                    if changed.is_err() {
                        return Err(LocalAIError::Cancelled);
                    }
                }
            }
        }
    }

    /// One probe round. The error is a human-readable diagnostic.
    pub async fn probe_once(&self) -> Result<(), String> {
        let models = self.client.list_models().await.map_err(|e| e.to_string())?;
        if models.is_empty() {
            return Err("server lists no models yet".to_string());
        }

        let status = self.client.canary().await.map_err(|e| e.to_string())?;
        if self.canary_policy.is_loaded(status) {
            Ok(())
        } else {
            Err(format!("canary completion returned HTTP {}", status))
        }
    }
}

fn timed_out(last_error: Option<String>) -> LocalAIError {
    LocalAIError::StartupTimeout {
        last_error: last_error.unwrap_or_else(|| "no probe completed".to_string()),
    }
}
