//! # State Lock
//!
//! At most one active execution per module's backing state.
//!
//! The lock lives in `status.lock` and is only ever changed by the pure
//! mutators below, applied inside the same status patch as the phase
//! transition they accompany. A lock never diverges from the state it guards.

use crate::crd::{
    LockStatus, Terraform, TerraformSpec, TerraformStatus, TFStateSpec, FORCE_UNLOCK_AUTO,
    FORCE_UNLOCK_NO,
};
use chrono::{DateTime, SecondsFormat, Utc};
use std::io::{self, Write};
use std::time::Duration;

/// Force-unlock requested through `backendConfig.state.forceUnlock`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceUnlock {
    /// Clear whatever lock is held
    Auto,
    /// Clear the backend lock with this ID, once
    LockId(String),
}

impl ForceUnlock {
    #[must_use]
    pub fn token(&self) -> &str {
        match self {
            ForceUnlock::Auto => FORCE_UNLOCK_AUTO,
            ForceUnlock::LockId(id) => id,
        }
    }
}

/// Result of `tfctl force-unlock` on the spec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceUnlockOutcome {
    /// The token was written
    Setting,
    /// The spec already holds the `auto` sentinel; nothing changed
    AlreadyAuto,
}

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn within_liveness(lock: &LockStatus, now: DateTime<Utc>, liveness: Duration) -> bool {
    let Some(acquired) = parse_time(lock.acquired_at.as_deref()) else {
        return false;
    };
    let age = now.signed_duration_since(acquired);
    age.to_std().map_or(true, |age| age <= liveness)
}

/// Take or refresh the lock for `instance`
///
/// Succeeds when the lock is free, or already held by `instance` and still
/// within the liveness window. A lock of ours that outlived the window is
/// treated like a foreign one: it needs a force-unlock.
pub fn try_acquire(
    status: &mut TerraformStatus,
    instance: &str,
    now: DateTime<Utc>,
    liveness: Duration,
) -> bool {
    let lock = status.lock.get_or_insert_with(LockStatus::default);
    let acquirable = match lock.holder.as_deref() {
        None | Some("") => true,
        Some(holder) => holder == instance && within_liveness(lock, now, liveness),
    };
    if acquirable {
        lock.holder = Some(instance.to_string());
        lock.acquired_at = Some(now.to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    acquirable
}

/// Whether a lock held by `instance` should be refreshed now
///
/// Refreshing at half the liveness window keeps a live lock from expiring
/// without rewriting status on every tick.
#[must_use]
pub fn refresh_due(
    status: &TerraformStatus,
    instance: &str,
    now: DateTime<Utc>,
    liveness: Duration,
) -> bool {
    let Some(lock) = status.lock.as_ref().filter(|_| is_held_by(status, instance)) else {
        return true;
    };
    !within_liveness(lock, now, liveness / 2)
}

/// Clear the holder; the force-unlock bookkeeping is kept
pub fn release(status: &mut TerraformStatus) {
    if let Some(lock) = status.lock.as_mut() {
        lock.holder = None;
        lock.acquired_at = None;
    }
}

#[must_use]
pub fn is_held_by(status: &TerraformStatus, instance: &str) -> bool {
    status
        .lock
        .as_ref()
        .and_then(|lock| lock.holder.as_deref())
        .is_some_and(|holder| holder == instance)
}

/// Force-unlock token in the spec, if any
#[must_use]
pub fn requested_force_unlock(spec: &TerraformSpec) -> Option<ForceUnlock> {
    match spec.force_unlock_token()? {
        FORCE_UNLOCK_NO => None,
        FORCE_UNLOCK_AUTO => Some(ForceUnlock::Auto),
        id => Some(ForceUnlock::LockId(id.to_string())),
    }
}

/// Force-unlock the state machine must act on now
///
/// A concrete lock ID fires once: it is ignored after it was recorded in
/// `lastAppliedForceUnlock`. `auto` fires whenever something blocks: a
/// backend lock reported by the last attempt, or a holder other than a live
/// lock of `instance`.
#[must_use]
pub fn pending_force_unlock(
    tf: &Terraform,
    instance: &str,
    now: DateTime<Utc>,
    liveness: Duration,
) -> Option<ForceUnlock> {
    let requested = requested_force_unlock(&tf.spec)?;
    let lock = tf.status.as_ref().and_then(|s| s.lock.as_ref());
    match requested {
        ForceUnlock::LockId(id) => {
            let already_applied = lock
                .and_then(|l| l.last_applied_force_unlock.as_deref())
                .is_some_and(|applied| applied == id);
            (!already_applied).then_some(ForceUnlock::LockId(id))
        }
        ForceUnlock::Auto => {
            let lock = lock?;
            let backend_locked = lock.pending.as_deref().is_some_and(|id| !id.is_empty());
            let foreign_holder = lock.is_held()
                && !(lock.holder.as_deref() == Some(instance) && within_liveness(lock, now, liveness));
            (backend_locked || foreign_holder).then_some(ForceUnlock::Auto)
        }
    }
}

/// Record a completed force-unlock and clear the lock it targeted
pub fn record_force_unlock(status: &mut TerraformStatus, unlock: &ForceUnlock) {
    let lock = status.lock.get_or_insert_with(LockStatus::default);
    lock.holder = None;
    lock.acquired_at = None;
    lock.pending = None;
    if let ForceUnlock::LockId(id) = unlock {
        lock.last_applied_force_unlock = Some(id.clone());
    }
}

/// Remember a backend lock held by someone else
pub fn record_foreign_lock(status: &mut TerraformStatus, lock_id: &str) {
    status.lock.get_or_insert_with(LockStatus::default).pending = Some(lock_id.to_string());
}

/// Write `lock_id` into `backendConfig.state.forceUnlock`
///
/// Missing `backendConfig` or `state` blocks are created. When the current
/// value is the `auto` sentinel the spec is left untouched and the caller is
/// told so.
pub fn apply_force_unlock<W: Write>(
    spec: &mut TerraformSpec,
    lock_id: &str,
    namespace: &str,
    name: &str,
    out: &mut W,
) -> io::Result<ForceUnlockOutcome> {
    let backend = spec.backend_config.get_or_insert_with(Default::default);
    let state = backend.state.get_or_insert_with(TFStateSpec::default);

    if state.force_unlock == FORCE_UNLOCK_AUTO {
        writeln!(
            out,
            " ForceUnlock set to '{FORCE_UNLOCK_AUTO}' on resource {namespace}/{name}"
        )?;
        return Ok(ForceUnlockOutcome::AlreadyAuto);
    }

    state.force_unlock = lock_id.to_string();
    writeln!(
        out,
        " Setting ForceUnlock to '{lock_id}' on resource {namespace}/{name}"
    )?;
    Ok(ForceUnlockOutcome::Setting)
}
