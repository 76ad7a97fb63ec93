//! # Status Helpers
//!
//! Pure helpers used inside status mutators: timestamps, conditions and the
//! phase a module settles into when nothing is in flight.

use crate::crd::{Condition, Phase, TerraformStatus, CONDITION_READY};
use chrono::{DateTime, SecondsFormat, Utc};
use std::time::Duration;

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";
pub const STATUS_UNKNOWN: &str = "Unknown";

/// RFC3339 timestamp with second precision, as written into status
#[must_use]
pub fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[must_use]
pub fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Time left until `since + period`, zero when already due or `since` is unknown
#[must_use]
pub fn remaining(since: Option<&str>, period: Duration, now: DateTime<Utc>) -> Duration {
    let Some(since) = parse_timestamp(since) else {
        return Duration::ZERO;
    };
    let Ok(period) = chrono::Duration::from_std(period) else {
        return Duration::ZERO;
    };
    (since + period)
        .signed_duration_since(now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Upsert a condition
///
/// `lastTransitionTime` only moves when the status value flips.
pub fn set_condition(
    status: &mut TerraformStatus,
    condition_type: &str,
    value: &str,
    reason: &str,
    message: impl Into<String>,
    generation: Option<i64>,
    now: DateTime<Utc>,
) {
    let message = message.into();
    if let Some(existing) = status
        .conditions
        .iter_mut()
        .find(|c| c.r#type == condition_type)
    {
        if existing.status != value {
            existing.last_transition_time = Some(timestamp(now));
        }
        existing.status = value.to_string();
        existing.reason = Some(reason.to_string());
        existing.message = Some(message);
        existing.observed_generation = generation;
        return;
    }
    status.conditions.push(Condition {
        r#type: condition_type.to_string(),
        status: value.to_string(),
        observed_generation: generation,
        last_transition_time: Some(timestamp(now)),
        reason: Some(reason.to_string()),
        message: Some(message),
    });
}

pub fn remove_condition(status: &mut TerraformStatus, condition_type: &str) {
    status.conditions.retain(|c| c.r#type != condition_type);
}

/// Ready condition shorthand
pub fn set_ready(
    status: &mut TerraformStatus,
    value: &str,
    reason: &str,
    message: impl Into<String>,
    generation: Option<i64>,
    now: DateTime<Utc>,
) {
    set_condition(status, CONDITION_READY, value, reason, message, generation, now);
}

/// Phase of a module with no transition in flight
///
/// Used when leaving `Suspended` or when no phase was recorded yet.
#[must_use]
pub fn settled_phase(status: &TerraformStatus) -> Phase {
    if let Some(plan) = status.plan.as_ref().filter(|p| p.pending_id().is_some()) {
        return if plan.is_drift_detection_only {
            Phase::Drifted
        } else {
            Phase::AwaitingApproval
        };
    }
    if status.last_applied_revision.is_some() {
        return Phase::Applied;
    }
    Phase::Initializing
}
