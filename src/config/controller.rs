//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use crate::controller::backoff::ExponentialBackoff;
use std::time::Duration;

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Identity written into `status.lock.holder` (`CONTROLLER_INSTANCE_ID`)
    pub instance_id: String,
    /// Port for `/metrics`, `/healthz` and `/readyz` (`METRICS_PORT`)
    pub metrics_port: u16,
    /// How long to wait for the HTTP server to bind (`SERVER_STARTUP_TIMEOUT_SECS`)
    pub server_startup_timeout_secs: u64,
    /// Poll interval while waiting for the HTTP server (`SERVER_POLL_INTERVAL_MS`)
    pub server_poll_interval_ms: u64,
    /// First transient-retry delay (`BACKOFF_BASE_MS`)
    pub backoff_base_ms: u64,
    /// Growth factor between consecutive retries (`BACKOFF_MULTIPLIER`)
    pub backoff_multiplier: f64,
    /// Cap on any retry delay (`BACKOFF_MAX_MS`)
    pub backoff_max_ms: u64,
    /// Consecutive transient failures before Ready=False is surfaced
    /// (`TRANSIENT_FAILURE_THRESHOLD`)
    pub transient_failure_threshold: u32,
    /// Maximum concurrent reconciliations across all resources
    /// (`MAX_CONCURRENT_RECONCILES`)
    pub max_concurrent_reconciles: usize,
    /// Bounded retries for conflicting status patches (`CONFLICT_RETRY_LIMIT`)
    pub conflict_retry_limit: u32,
    /// Runner image used when the resource does not override it (`RUNNER_IMAGE`)
    pub runner_image: String,
    /// Port the runner serves its session API on (`RUNNER_PORT`)
    pub runner_port: u16,
    /// Bound on waiting for a runner pod to become ready (`RUNNER_READY_TIMEOUT_SECS`)
    pub runner_ready_timeout_secs: u64,
    /// Poll interval while waiting for runner readiness (`RUNNER_POLL_INTERVAL_MS`)
    pub runner_poll_interval_ms: u64,
    /// Bound on runner pod deletion (`RUNNER_TEARDOWN_TIMEOUT_SECS`)
    pub runner_teardown_timeout_secs: u64,
    /// Bound on a single session command (`COMMAND_TIMEOUT_SECS`)
    pub command_timeout_secs: u64,
    /// Bound on the session readiness probe (`PROBE_TIMEOUT_SECS`)
    pub probe_timeout_secs: u64,
    /// Bound on a single webhook call (`WEBHOOK_TIMEOUT_SECS`)
    pub webhook_timeout_secs: u64,
    /// Default bound on a health check without its own timeout
    /// (`HEALTH_CHECK_TIMEOUT_SECS`)
    pub health_check_timeout_secs: u64,
    /// Liveness window of a lock held by this instance (`LOCK_LIVENESS_SECS`)
    pub lock_liveness_secs: u64,
    /// Requeue while waiting on source or dependencies (`DEPENDENCY_REQUEUE_SECS`)
    pub dependency_requeue_secs: u64,
    /// Poll interval of the deletion/suspension watcher (`CANCEL_POLL_INTERVAL_MS`)
    pub cancel_poll_interval_ms: u64,
    /// Watch stream restart delay after unknown errors (`WATCH_RESTART_DELAY_SECS`)
    pub watch_restart_delay_secs: u64,
    /// Watch stream restart delay after the stream ends
    /// (`WATCH_RESTART_DELAY_AFTER_END_SECS`)
    pub watch_restart_delay_after_end_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            instance_id: CONTROLLER_NAME.to_string(),
            metrics_port: DEFAULT_METRICS_PORT,
            server_startup_timeout_secs: DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            server_poll_interval_ms: DEFAULT_SERVER_POLL_INTERVAL_MS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            transient_failure_threshold: DEFAULT_TRANSIENT_FAILURE_THRESHOLD,
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            conflict_retry_limit: DEFAULT_CONFLICT_RETRY_LIMIT,
            runner_image: DEFAULT_RUNNER_IMAGE.to_string(),
            runner_port: DEFAULT_RUNNER_PORT,
            runner_ready_timeout_secs: DEFAULT_RUNNER_READY_TIMEOUT_SECS,
            runner_poll_interval_ms: DEFAULT_RUNNER_POLL_INTERVAL_MS,
            runner_teardown_timeout_secs: DEFAULT_RUNNER_TEARDOWN_TIMEOUT_SECS,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            webhook_timeout_secs: DEFAULT_WEBHOOK_TIMEOUT_SECS,
            health_check_timeout_secs: DEFAULT_HEALTH_CHECK_TIMEOUT_SECS,
            lock_liveness_secs: DEFAULT_LOCK_LIVENESS_SECS,
            dependency_requeue_secs: DEFAULT_DEPENDENCY_REQUEUE_SECS,
            cancel_poll_interval_ms: DEFAULT_CANCEL_POLL_INTERVAL_MS,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            watch_restart_delay_after_end_secs: DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        // Fall back to the pod hostname so replicas get distinct lock identities
        let default_instance =
            std::env::var("HOSTNAME").unwrap_or_else(|_| CONTROLLER_NAME.to_string());
        Self {
            instance_id: env_var_or_default_str("CONTROLLER_INSTANCE_ID", &default_instance),
            metrics_port: env_var_or_default("METRICS_PORT", DEFAULT_METRICS_PORT),
            server_startup_timeout_secs: env_var_or_default(
                "SERVER_STARTUP_TIMEOUT_SECS",
                DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            ),
            server_poll_interval_ms: env_var_or_default(
                "SERVER_POLL_INTERVAL_MS",
                DEFAULT_SERVER_POLL_INTERVAL_MS,
            ),
            backoff_base_ms: env_var_or_default("BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS),
            backoff_multiplier: env_var_or_default(
                "BACKOFF_MULTIPLIER",
                DEFAULT_BACKOFF_MULTIPLIER,
            ),
            backoff_max_ms: env_var_or_default("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            transient_failure_threshold: env_var_or_default(
                "TRANSIENT_FAILURE_THRESHOLD",
                DEFAULT_TRANSIENT_FAILURE_THRESHOLD,
            ),
            max_concurrent_reconciles: env_var_or_default(
                "MAX_CONCURRENT_RECONCILES",
                DEFAULT_MAX_CONCURRENT_RECONCILES,
            ),
            conflict_retry_limit: env_var_or_default(
                "CONFLICT_RETRY_LIMIT",
                DEFAULT_CONFLICT_RETRY_LIMIT,
            ),
            runner_image: env_var_or_default_str("RUNNER_IMAGE", DEFAULT_RUNNER_IMAGE),
            runner_port: env_var_or_default("RUNNER_PORT", DEFAULT_RUNNER_PORT),
            runner_ready_timeout_secs: env_var_or_default(
                "RUNNER_READY_TIMEOUT_SECS",
                DEFAULT_RUNNER_READY_TIMEOUT_SECS,
            ),
            runner_poll_interval_ms: env_var_or_default(
                "RUNNER_POLL_INTERVAL_MS",
                DEFAULT_RUNNER_POLL_INTERVAL_MS,
            ),
            runner_teardown_timeout_secs: env_var_or_default(
                "RUNNER_TEARDOWN_TIMEOUT_SECS",
                DEFAULT_RUNNER_TEARDOWN_TIMEOUT_SECS,
            ),
            command_timeout_secs: env_var_or_default(
                "COMMAND_TIMEOUT_SECS",
                DEFAULT_COMMAND_TIMEOUT_SECS,
            ),
            probe_timeout_secs: env_var_or_default(
                "PROBE_TIMEOUT_SECS",
                DEFAULT_PROBE_TIMEOUT_SECS,
            ),
            webhook_timeout_secs: env_var_or_default(
                "WEBHOOK_TIMEOUT_SECS",
                DEFAULT_WEBHOOK_TIMEOUT_SECS,
            ),
            health_check_timeout_secs: env_var_or_default(
                "HEALTH_CHECK_TIMEOUT_SECS",
                DEFAULT_HEALTH_CHECK_TIMEOUT_SECS,
            ),
            lock_liveness_secs: env_var_or_default(
                "LOCK_LIVENESS_SECS",
                DEFAULT_LOCK_LIVENESS_SECS,
            ),
            dependency_requeue_secs: env_var_or_default(
                "DEPENDENCY_REQUEUE_SECS",
                DEFAULT_DEPENDENCY_REQUEUE_SECS,
            ),
            cancel_poll_interval_ms: env_var_or_default(
                "CANCEL_POLL_INTERVAL_MS",
                DEFAULT_CANCEL_POLL_INTERVAL_MS,
            ),
            watch_restart_delay_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_SECS",
                DEFAULT_WATCH_RESTART_DELAY_SECS,
            ),
            watch_restart_delay_after_end_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_AFTER_END_SECS",
                DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS,
            ),
        }
    }

    /// Transient-retry schedule built from the backoff settings
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.backoff_base_ms),
            self.backoff_multiplier,
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    /// Get runner ready timeout duration
    pub fn runner_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.runner_ready_timeout_secs)
    }

    /// Get runner poll interval duration
    pub fn runner_poll_interval(&self) -> Duration {
        Duration::from_millis(self.runner_poll_interval_ms)
    }

    /// Get runner teardown timeout duration
    pub fn runner_teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.runner_teardown_timeout_secs)
    }

    /// Get session command timeout duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Get session probe timeout duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Get webhook timeout duration
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    /// Get default health check timeout duration
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    /// Get lock liveness window
    pub fn lock_liveness(&self) -> Duration {
        Duration::from_secs(self.lock_liveness_secs)
    }

    /// Get dependency/source wait requeue duration
    pub fn dependency_requeue(&self) -> Duration {
        Duration::from_secs(self.dependency_requeue_secs)
    }

    /// Get cancellation poll interval
    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms)
    }

    /// Get watch restart delay duration
    pub fn watch_restart_delay_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }

    /// Get watch restart delay after end duration
    pub fn watch_restart_delay_after_end_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_after_end_secs)
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_schedule_is_capped() {
        let config = ControllerConfig::default();
        let backoff = config.backoff();
        assert_eq!(backoff.delay(1), Duration::from_secs(5));
        assert_eq!(backoff.delay(2), Duration::from_secs(10));
        assert_eq!(backoff.delay(50), Duration::from_secs(300));
    }

    #[test]
    fn test_env_var_or_default_falls_back_on_garbage() {
        assert_eq!(
            env_var_or_default("TF_CONTROLLER_TEST_UNSET_VARIABLE", 42u32),
            42
        );
    }
}
