//! Dependency resolver tests

mod common;

use common::*;
use serde_json::json;
use tf_controller::controller::dependency::{is_ready, is_ready_with_depth, Readiness};
use tf_controller::crd::{Condition, Terraform, TerraformStatus};

fn ready_at(generation: i64) -> TerraformStatus {
    TerraformStatus {
        observed_generation: Some(generation),
        conditions: vec![Condition {
            r#type: "Ready".to_string(),
            status: "True".to_string(),
            observed_generation: Some(generation),
            last_transition_time: None,
            reason: Some("Applied".to_string()),
            message: None,
        }],
        ..Default::default()
    }
}

fn depends_on(name: &str, dependencies: &[&str]) -> Terraform {
    let refs: Vec<_> = dependencies.iter().map(|d| json!({"name": d})).collect();
    terraform(name, json!({"dependsOn": refs}))
}

fn stored(store: &FakeStore, name: &str) -> Terraform {
    store.object(&key(name)).expect("inserted")
}

#[tokio::test]
async fn test_no_dependencies_is_ready() {
    let store = FakeStore::default();
    store.insert(terraform("app", json!({})));
    let readiness = is_ready(&store, &stored(&store, "app")).await.unwrap();
    assert_eq!(readiness, Readiness::ready());
}

#[tokio::test]
async fn test_ready_dependency_at_current_generation() {
    let store = FakeStore::default();
    let mut network = terraform("network", json!({}));
    network.status = Some(ready_at(1));
    store.insert(network);
    store.insert(depends_on("app", &["network"]));

    let readiness = is_ready(&store, &stored(&store, "app")).await.unwrap();
    assert!(readiness.ready);
}

#[tokio::test]
async fn test_stale_observed_generation_blocks() {
    let store = FakeStore::default();
    let mut network = terraform("network", json!({}));
    network.status = Some(ready_at(1));
    store.insert(network);
    store.update_spec(&key("network"), |tf| tf.spec.targets = vec!["module.vpc".to_string()]);
    store.insert(depends_on("app", &["network"]));

    let readiness = is_ready(&store, &stored(&store, "app")).await.unwrap();
    assert_eq!(
        readiness,
        Readiness::blocked("dependency 'flux-system/network' is not ready")
    );
}

#[tokio::test]
async fn test_missing_dependency_blocks() {
    let store = FakeStore::default();
    store.insert(depends_on("app", &["network"]));

    let readiness = is_ready(&store, &stored(&store, "app")).await.unwrap();
    assert_eq!(
        readiness.reason.as_deref(),
        Some("dependency 'flux-system/network' not found")
    );
}

#[tokio::test]
async fn test_cross_namespace_dependency() {
    let store = FakeStore::default();
    let mut shared = terraform("dns", json!({}));
    shared.metadata.namespace = Some("platform".to_string());
    shared.status = Some(ready_at(1));
    store.insert(shared);
    store.insert(terraform(
        "app",
        json!({"dependsOn": [{"name": "dns", "namespace": "platform"}]}),
    ));

    let readiness = is_ready(&store, &stored(&store, "app")).await.unwrap();
    assert!(readiness.ready);
}

#[tokio::test]
async fn test_cycle_is_detected() {
    let store = FakeStore::default();
    let mut b = depends_on("b", &["a"]);
    b.status = Some(ready_at(1));
    store.insert(b);
    store.insert(depends_on("a", &["b"]));

    let readiness = is_ready(&store, &stored(&store, "a")).await.unwrap();
    assert!(!readiness.ready);
    assert_eq!(
        readiness.reason.as_deref(),
        Some("dependency cycle detected: flux-system/a → flux-system/b → flux-system/a")
    );
}

#[tokio::test]
async fn test_self_dependency_is_a_cycle() {
    let store = FakeStore::default();
    store.insert(depends_on("a", &["a"]));

    let readiness = is_ready(&store, &stored(&store, "a")).await.unwrap();
    assert!(readiness
        .reason
        .is_some_and(|r| r.starts_with("dependency cycle detected")));
}

#[tokio::test]
async fn test_long_chain_is_cut_at_max_depth() {
    let store = FakeStore::default();
    for (name, next) in [("a", "b"), ("b", "c"), ("c", "d"), ("d", "e")] {
        store.insert(depends_on(name, &[next]));
    }
    store.insert(terraform("e", json!({})));

    let readiness = is_ready_with_depth(&store, &stored(&store, "a"), 2)
        .await
        .unwrap();
    assert!(!readiness.ready);
    assert!(readiness
        .reason
        .is_some_and(|r| r.contains("exceeds maximum depth of 2")));
}

#[tokio::test]
async fn test_diamond_is_not_a_cycle() {
    let store = FakeStore::default();
    let mut b = depends_on("b", &["d"]);
    b.status = Some(ready_at(1));
    let mut c = depends_on("c", &["d"]);
    c.status = Some(ready_at(1));
    let mut d = terraform("d", json!({}));
    d.status = Some(ready_at(1));
    store.insert(b);
    store.insert(c);
    store.insert(d);
    store.insert(depends_on("a", &["b", "c"]));

    let readiness = is_ready(&store, &stored(&store, "a")).await.unwrap();
    assert!(readiness.ready);
}
