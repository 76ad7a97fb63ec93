//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Field manager / controller name used for patches and bookkeeping labels
pub const CONTROLLER_NAME: &str = "tf-controller";

/// Finalizer guarding destroy-then-finalize on deletion
pub const FINALIZER: &str = "finalizers.tf.contrib.fluxcd.io";

/// Annotation touched by `tfctl reconcile` (and any Flux tooling) to request an immediate tick
pub const RECONCILE_REQUEST_ANNOTATION: &str = "reconcile.fluxcd.io/requestedAt";

/// Label carrying the owning Terraform resource name on runner pods and output secrets
pub const TERRAFORM_NAME_LABEL: &str = "infra.contrib.fluxcd.io/terraform";

/// Label carrying the hash of the rendered runner pod template
pub const TEMPLATE_HASH_LABEL: &str = "infra.contrib.fluxcd.io/template-hash";

/// Standard label identifying the controller that created an object
pub const CREATED_BY_LABEL: &str = "app.kubernetes.io/created-by";

/// Suffix appended to the Terraform name to form the runner pod name
pub const RUNNER_POD_SUFFIX: &str = "tf-runner";

/// Name of the runner container inside the runner pod
pub const RUNNER_CONTAINER_NAME: &str = "tf-runner";

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default runner image when the resource does not override it
pub const DEFAULT_RUNNER_IMAGE: &str = "ghcr.io/flux-iac/tf-runner:v0.16.0";

/// Default port the runner serves its session API on
pub const DEFAULT_RUNNER_PORT: u16 = 30000;

/// Default time to wait for a runner pod to become ready (seconds)
pub const DEFAULT_RUNNER_READY_TIMEOUT_SECS: u64 = 120;

/// Default interval between runner readiness polls (milliseconds)
pub const DEFAULT_RUNNER_POLL_INTERVAL_MS: u64 = 1000;

/// Default bound on runner pod deletion (seconds)
pub const DEFAULT_RUNNER_TEARDOWN_TIMEOUT_SECS: u64 = 30;

/// Default runner termination grace period (seconds)
pub const DEFAULT_RUNNER_GRACE_PERIOD_SECS: i64 = 30;

/// Default bound on a single session command round trip (seconds)
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 900;

/// Default bound on the session readiness probe (seconds)
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// Default bound on a webhook callback (seconds)
pub const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 30;

/// Default bound on a single health check (seconds)
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u64 = 10;

/// Default exponential backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 5000;

/// Default exponential backoff multiplier
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default exponential backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;

/// Consecutive transient failures tolerated before Ready=False is surfaced
pub const DEFAULT_TRANSIENT_FAILURE_THRESHOLD: u32 = 3;

/// Window during which a lock held by this instance may be re-acquired (seconds)
pub const DEFAULT_LOCK_LIVENESS_SECS: u64 = 900;

/// Requeue used while a resource waits for its source or dependencies (seconds)
pub const DEFAULT_DEPENDENCY_REQUEUE_SECS: u64 = 30;

/// Interval at which in-flight waits poll for deletion or suspension (milliseconds)
pub const DEFAULT_CANCEL_POLL_INTERVAL_MS: u64 = 2000;

/// Bounded retries for optimistic-concurrency status patches
pub const DEFAULT_CONFLICT_RETRY_LIMIT: u32 = 5;

/// Default number of resources reconciled concurrently
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 4;

/// Default delay before restarting watch stream after unknown errors (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Default delay before restarting watch stream after it ends (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS: u64 = 1;

/// Default reconcile interval for resources that do not set one
pub const DEFAULT_INTERVAL: &str = "5m";

/// Default retry interval for semantic failures
pub const DEFAULT_RETRY_INTERVAL: &str = "15s";

/// Deepest dependency chain the resolver follows before failing closed
pub const MAX_DEPENDENCY_DEPTH: usize = 32;

/// Default namespace used by `tfctl`
pub const DEFAULT_CLI_NAMESPACE: &str = "flux-system";
