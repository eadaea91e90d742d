//! Configuration for the fleet daemon.

use std::time::Duration;

use anyhow::{Context, Result};

/// Timing constants of the instance supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorTimings {
    /// How long an opened connection may take to report ready.
    pub connect_timeout: Duration,

    /// Pause between tearing down a handle and opening its replacement.
    pub reconnect_grace: Duration,

    /// Delay between the ready event and mode restoration.
    pub settle_delay: Duration,

    /// Silence longer than this marks a connection as stuck.
    pub activity_threshold: Duration,

    /// How often the activity monitor looks at the clock.
    pub activity_check_interval: Duration,

    /// Period of reachability probes for status-only instances.
    pub probe_interval: Duration,

    /// Upper bound of a single reachability probe.
    pub probe_timeout: Duration,

    /// How long the pool waits for an instance to acknowledge teardown.
    pub disconnect_timeout: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            reconnect_grace: Duration::from_secs(1),
            settle_delay: Duration::from_millis(1500),
            activity_threshold: Duration::from_secs(300),
            activity_check_interval: Duration::from_secs(30),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file holding the roster.
    pub roster_path: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Fleet status log interval in seconds.
    pub status_interval_secs: u64,

    /// Supervisor timings.
    pub timings: SupervisorTimings,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let roster_path = std::env::var("FLEET_ROSTER_PATH")
            .unwrap_or_else(|_| "/var/lib/fleetd/roster.db".to_string());

        let log_level = std::env::var("FLEET_LOG_LEVEL")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| "info".to_string());

        let status_interval_secs = env_secs("FLEET_STATUS_INTERVAL_SECS")?.unwrap_or(60);

        let mut timings = SupervisorTimings::default();
        if let Some(secs) = env_secs("FLEET_CONNECT_TIMEOUT_SECS")? {
            timings.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs("FLEET_ACTIVITY_THRESHOLD_SECS")? {
            timings.activity_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs("FLEET_ACTIVITY_CHECK_SECS")? {
            timings.activity_check_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs("FLEET_PROBE_INTERVAL_SECS")? {
            timings.probe_interval = Duration::from_secs(secs);
        }

        if timings.activity_check_interval >= timings.activity_threshold {
            anyhow::bail!(
                "FLEET_ACTIVITY_CHECK_SECS ({}s) must be smaller than FLEET_ACTIVITY_THRESHOLD_SECS ({}s)",
                timings.activity_check_interval.as_secs(),
                timings.activity_threshold.as_secs()
            );
        }

        Ok(Self {
            roster_path,
            log_level,
            status_interval_secs,
            timings,
        })
    }
}

/// Reads a positive number of seconds, `None` when unset.
fn env_secs(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{key} must be a whole number of seconds, got {raw:?}"))?;
            if secs == 0 {
                anyhow::bail!("{key} must be greater than zero");
            }
            Ok(Some(secs))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let timings = SupervisorTimings::default();
        assert_eq!(timings.connect_timeout, Duration::from_secs(30));
        assert_eq!(timings.activity_threshold, Duration::from_secs(300));
        assert_eq!(timings.activity_check_interval, Duration::from_secs(30));
        assert!(timings.activity_check_interval < timings.activity_threshold);
        assert_eq!(timings.probe_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_env_secs_unset() {
        assert!(env_secs("FLEET_TEST_SURELY_UNSET_VARIABLE").unwrap().is_none());
    }
}
