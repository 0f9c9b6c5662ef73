//! Supervisor configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::paths;
use crate::readiness::{CanaryPolicy, DEFAULT_POLL_INTERVAL, DEFAULT_STARTUP_TIMEOUT};
use crate::recovery::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF};
use crate::system_info::HostFacts;
use crate::watchdog::DEFAULT_WATCHDOG_INTERVAL;

/// Default wait after each of the interrupt and terminate signals.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Configuration for [`LocalServer`](crate::LocalServer).
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Explicit llama-server binary, searched before the usual locations.
    pub server_binary: Option<PathBuf>,
    /// Time between readiness probes.
    pub poll_interval: Duration,
    /// Deadline for a launch to become ready.
    pub startup_timeout: Duration,
    /// Time between watchdog liveness checks.
    pub watchdog_interval: Duration,
    /// Automatic relaunches allowed before entering the error state.
    pub max_retries: u32,
    /// Pause before each automatic relaunch.
    pub retry_backoff: Duration,
    /// Wait after each of the interrupt and terminate signals.
    pub shutdown_grace: Duration,
    pub canary_policy: CanaryPolicy,
    /// Kill the server when this process disappears.
    pub owner_pid: Option<u32>,
    /// Fixed host facts instead of querying the machine.
    pub host_facts: Option<HostFacts>,
    /// Where settings are read from and saved to; `None` disables persistence.
    pub settings_path: Option<PathBuf>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            server_binary: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            canary_policy: CanaryPolicy::default(),
            owner_pid: None,
            host_facts: None,
            settings_path: Some(paths::settings_path()),
        }
    }
}

impl SupervisorOptions {
    /// Create options from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let server_binary = std::env::var_os("KINDLING_SERVER_BIN").map(PathBuf::from);

        let startup_timeout = env_parse::<u64>("KINDLING_STARTUP_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.startup_timeout);

        let watchdog_interval = env_parse::<u64>("KINDLING_WATCHDOG_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.watchdog_interval);

        let max_retries = env_parse("KINDLING_MAX_RETRIES").unwrap_or(defaults.max_retries);

        let retry_backoff = env_parse::<u64>("KINDLING_RETRY_BACKOFF_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_backoff);

        let shutdown_grace = env_parse::<u64>("KINDLING_SHUTDOWN_GRACE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.shutdown_grace);

        let canary_policy = std::env::var("KINDLING_CANARY")
            .map(|v| match v.to_lowercase().as_str() {
                "strict" | "200" => CanaryPolicy::Strict200,
                _ => CanaryPolicy::AnyNon503,
            })
            .unwrap_or(defaults.canary_policy);

        let owner_pid = env_parse("KINDLING_OWNER_PID");

        Self {
            server_binary,
            startup_timeout,
            watchdog_interval,
            max_retries,
            retry_backoff,
            shutdown_grace,
            canary_policy,
            owner_pid,
            ..defaults
        }
    }

    /// Create a builder for configuration.
    pub fn builder() -> SupervisorOptionsBuilder {
        SupervisorOptionsBuilder::default()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Builder for supervisor options.
#[derive(Debug, Default)]
pub struct SupervisorOptionsBuilder {
    options: SupervisorOptions,
}

impl SupervisorOptionsBuilder {
    pub fn server_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.server_binary = Some(path.into());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.options.poll_interval = interval;
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.options.startup_timeout = timeout;
        self
    }

    pub fn watchdog_interval(mut self, interval: Duration) -> Self {
        self.options.watchdog_interval = interval;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.options.max_retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.options.retry_backoff = backoff;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.options.shutdown_grace = grace;
        self
    }

    pub fn canary_policy(mut self, policy: CanaryPolicy) -> Self {
        self.options.canary_policy = policy;
        self
    }

    pub fn owner_pid(mut self, pid: u32) -> Self {
        self.options.owner_pid = Some(pid);
        self
    }

    pub fn host_facts(mut self, facts: HostFacts) -> Self {
        self.options.host_facts = Some(facts);
        self
    }

    pub fn settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.settings_path = Some(path.into());
        self
    }

    /// Keep settings in memory only.
    pub fn without_persistence(mut self) -> Self {
        self.options.settings_path = None;
        self
    }

    pub fn build(self) -> SupervisorOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SupervisorOptions::default();
        assert_eq!(options.poll_interval, Duration::from_secs(2));
        assert_eq!(options.startup_timeout, Duration::from_secs(120));
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.canary_policy, CanaryPolicy::AnyNon503);
        assert!(options.settings_path.is_some());
    }

    #[test]
    fn test_builder() {
        let options = SupervisorOptions::builder()
            .server_binary("/opt/llama/llama-server")
            .max_retries(5)
            .retry_backoff(Duration::from_millis(10))
            .canary_policy(CanaryPolicy::Strict200)
            .without_persistence()
            .build();
        assert_eq!(
            options.server_binary.as_deref(),
            Some(std::path::Path::new("/opt/llama/llama-server"))
        );
        assert_eq!(options.max_retries, 5);
        assert_eq!(options.retry_backoff, Duration::from_millis(10));
        assert_eq!(options.canary_policy, CanaryPolicy::Strict200);
        assert!(options.settings_path.is_none());
    }
}
