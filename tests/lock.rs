//! State lock tests across controller instances

mod common;

use common::*;
use kube_runtime::controller::Action;
use serde_json::json;
use std::time::Duration;
use tf_controller::controller::reconciler::status::timestamp;
use tf_controller::crd::{LockStatus, Phase, TerraformStatus};

const PEER: &str = "tf-controller-b";

fn locked_by(holder: &str, acquired_hours_ago: i64) -> TerraformStatus {
    TerraformStatus {
        lock: Some(LockStatus {
            holder: Some(holder.to_string()),
            acquired_at: Some(timestamp(
                chrono::Utc::now() - chrono::Duration::hours(acquired_hours_ago),
            )),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_peer_cannot_apply_a_plan_locked_by_another_instance() {
    let a = Harness::new();
    let key = a.store.insert(terraform("hello-world", json!({"approvePlan": ""})));
    a.step(&key).await;
    assert_eq!(a.store.status(&key).phase, Some(Phase::AwaitingApproval));

    let b = a.peer(PEER);
    a.store
        .update_spec(&key, |tf| tf.spec.approve_plan = PLAN_ID.to_string());
    b.step(&key).await;

    let status = a.store.status(&key);
    assert_eq!(condition(&status, "StateLocked"), pair("True", "StateLocked"));
    assert_eq!(ready(&status), pair("False", "StateLocked"));
    assert_eq!(
        status.lock.as_ref().and_then(|l| l.holder.as_deref()),
        Some(INSTANCE)
    );
    assert_eq!(status.pending_plan(), Some(PLAN_ID));
    assert!(!a.script().calls().iter().any(|c| c.starts_with("apply")));

    // The holder finishes its own plan
    a.store.clear_retry_wait(&key);
    a.step(&key).await;
    let status = a.store.status(&key);
    assert_eq!(status.phase, Some(Phase::Applied));
    assert_eq!(
        a.script().calls().iter().filter(|c| c.starts_with("apply")).count(),
        1
    );
}

#[tokio::test]
async fn test_auto_force_unlock_clears_a_stale_foreign_holder() {
    let h = Harness::new();
    let mut tf = terraform(
        "hello-world",
        json!({"backendConfig": {"state": {"forceUnlock": "auto"}}}),
    );
    tf.status = Some(locked_by("tf-controller-old", 2));
    let key = h.store.insert(tf);

    let action = h.step(&key).await;
    assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    let status = h.store.status(&key);
    assert!(status.lock.as_ref().is_none_or(|l| l.holder.is_none()));
    assert_eq!(condition(&status, "StateLocked"), pair("False", "ForceUnlocked"));
    assert!(h.script().calls().is_empty());

    h.step(&key).await;
    assert_eq!(h.store.status(&key).phase, Some(Phase::Applied));
    assert_eq!(
        h.script().calls(),
        vec![
            "init".to_string(),
            format!("plan:{PLAN_ID}"),
            format!("apply:{PLAN_ID}")
        ]
    );
}

#[tokio::test]
async fn test_own_expired_lock_needs_force_unlock() {
    let h = Harness::new();
    let mut tf = terraform("hello-world", json!({}));
    tf.status = Some(locked_by(INSTANCE, 2));
    let key = h.store.insert(tf);

    h.step(&key).await;

    let status = h.store.status(&key);
    assert_eq!(status.phase, Some(Phase::Failed));
    assert_eq!(ready(&status), pair("False", "StateLocked"));
    assert!(h.script().calls().is_empty());
}

#[tokio::test]
async fn test_auto_force_unlock_clears_a_live_foreign_holder() {
    let h = Harness::new();
    let mut tf = terraform(
        "hello-world",
        json!({"backendConfig": {"state": {"forceUnlock": "auto"}}}),
    );
    tf.status = Some(locked_by(PEER, 0));
    let key = h.store.insert(tf);

    h.step(&key).await;

    // `auto` clears any holder that is not a live lock of ours
    let status = h.store.status(&key);
    assert_eq!(condition(&status, "StateLocked"), pair("False", "ForceUnlocked"));
}
