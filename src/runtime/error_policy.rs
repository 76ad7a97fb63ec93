//! # Error Policy
//!
//! Requeue policy for reconcile errors that could not be recorded in status,
//! and classification of watch stream errors.

use crate::controller::reconciler::{Reconciler, ReconcilerError};
use crate::controller::store::ObjectKey;
use crate::crd::Terraform;
use crate::observability;
use kube_runtime::controller::Action;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Requeue a resource whose tick failed before its status could be written
///
/// Ordinary failures are recorded in status by the reconciler and never reach
/// this policy; what arrives here is a store failure (API unreachable,
/// exhausted conflict retries). Backoff is tracked per resource.
pub fn handle_reconciliation_error(
    obj: Arc<Terraform>,
    error: &ReconcilerError,
    ctx: Arc<Reconciler>,
) -> Action {
    let key = ObjectKey::from_resource(&obj);
    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        resource.name = %key.name,
        resource.namespace = %key.namespace,
        error = %error
    );
    let _error_guard = error_span.enter();

    error!("Reconciliation error for {}: {:?}", key, error);
    let delay = ctx.record_transient_failure(&key);
    info!(
        "🔄 Retrying with exponential backoff: {}s (trigger source: error-backoff)",
        delay.as_secs()
    );

    observability::metrics::increment_requeues_total("error-backoff");
    Action::requeue(delay)
}

/// How the watch loop should treat a stream error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorKind {
    Unauthorized,
    Expired,
    Throttled,
    NotFound,
    Other,
}

/// Classify a watch stream error from its debug rendering
///
/// 404 is checked first: a plain-text 404 body surfaces as a decode error
/// that also mentions `WatchFailed`.
#[must_use]
pub fn classify_watch_error(error_string: &str) -> WatchErrorKind {
    let is_not_found = error_string.contains("ObjectNotFound")
        || error_string.contains("404")
        || error_string.contains("not found");
    if is_not_found {
        return WatchErrorKind::NotFound;
    }
    if error_string.contains("401") || error_string.contains("Unauthorized") {
        return WatchErrorKind::Unauthorized;
    }
    if error_string.contains("410")
        || error_string.contains("too old resource version")
        || error_string.contains("Expired")
        || error_string.contains("Gone")
    {
        return WatchErrorKind::Expired;
    }
    if error_string.contains("429")
        || error_string.contains("storage is (re)initializing")
        || error_string.contains("TooManyRequests")
    {
        return WatchErrorKind::Throttled;
    }
    WatchErrorKind::Other
}

/// Handle a watch stream error
///
/// Returns `None` to drop the event and let the stream restart, `Some(())` to
/// keep going.
pub async fn handle_watch_stream_error(
    error_string: &str,
    backoff: &AtomicU64,
    max_backoff_ms: u64,
    watch_restart_delay: Duration,
) -> Option<()> {
    let error_span = tracing::span!(
        tracing::Level::WARN,
        "controller.watch.error",
        error = %error_string
    );
    let _error_guard = error_span.enter();

    match classify_watch_error(error_string) {
        WatchErrorKind::Unauthorized => {
            error!("❌ Watch authentication failed (401 Unauthorized) - RBAC may have been revoked or token expired");
            error!("🔍 Diagnostics:");
            error!("   1. kubectl get clusterrole tf-controller");
            error!("   2. kubectl get clusterrolebinding tf-controller -o yaml");
            error!(
                "   3. kubectl auth can-i watch terraforms.infra.contrib.fluxcd.io --as=system:serviceaccount:flux-system:tf-controller --all-namespaces"
            );
            warn!(
                "⏳ Waiting {}s before retrying watch (RBAC may need time to propagate)...",
                watch_restart_delay.as_secs()
            );
            tokio::time::sleep(watch_restart_delay).await;
            None
        }
        WatchErrorKind::Expired => {
            warn!("Watch resource version expired (410) - this is normal during pod restarts, watch will restart");
            None
        }
        WatchErrorKind::Throttled => {
            let current = backoff.load(Ordering::Relaxed);
            warn!(
                "API server storage reinitializing (429), backing off for {}ms before restart...",
                current
            );
            tokio::time::sleep(Duration::from_millis(current)).await;
            backoff.store(current.saturating_mul(2).min(max_backoff_ms), Ordering::Relaxed);
            None
        }
        WatchErrorKind::NotFound => {
            warn!(
                "Resource not found (404) - normal if the object was deleted or the CRD is missing. Error: {}",
                error_string
            );
            Some(())
        }
        WatchErrorKind::Other => {
            error!("Controller stream error: {}", error_string);
            tokio::time::sleep(watch_restart_delay).await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_wins_over_watch_failed() {
        assert_eq!(
            classify_watch_error("WatchFailed(SerdeError(invalid type: integer `404`))"),
            WatchErrorKind::NotFound
        );
        assert_eq!(
            classify_watch_error("Api(ErrorResponse { code: 401, reason: \"Unauthorized\" })"),
            WatchErrorKind::Unauthorized
        );
        assert_eq!(
            classify_watch_error("too old resource version: 123 (456)"),
            WatchErrorKind::Expired
        );
        assert_eq!(
            classify_watch_error("storage is (re)initializing"),
            WatchErrorKind::Throttled
        );
        assert_eq!(classify_watch_error("connection reset"), WatchErrorKind::Other);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_doubles_backoff_up_to_cap() {
        let backoff = AtomicU64::new(400);
        let outcome =
            handle_watch_stream_error("429 TooManyRequests", &backoff, 1000, Duration::from_secs(1))
                .await;
        assert!(outcome.is_none());
        assert_eq!(backoff.load(Ordering::Relaxed), 800);

        handle_watch_stream_error("429 TooManyRequests", &backoff, 1000, Duration::from_secs(1))
            .await;
        assert_eq!(backoff.load(Ordering::Relaxed), 1000);
    }
}
