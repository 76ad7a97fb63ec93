//! # Validation Tests
//!
//! Spec validation as the reconciler applies it before every transition.

mod common;

use common::terraform;
use serde_json::json;
use tf_controller::controller::reconciler::validation::validate_terraform;

fn rejection(extra: serde_json::Value) -> String {
    validate_terraform(&terraform("hello-world", extra))
        .expect_err("spec should be rejected")
        .to_string()
}

#[test]
fn test_minimal_spec_is_valid() {
    assert!(validate_terraform(&terraform("hello-world", json!({}))).is_ok());
}

#[test]
fn test_full_spec_is_valid() {
    let tf = terraform(
        "hello-world",
        json!({
            "interval": "1h30m",
            "retryInterval": "30s",
            "driftDetectionInterval": "10m",
            "vars": [
                {"name": "region", "value": "eu-west-1"},
                {"name": "token", "valueFrom": {"secretKeyRef": {"name": "api", "key": "token"}}}
            ],
            "writeOutputsToSecret": {"name": "outputs", "outputs": ["bucket", "arn:bucket_arn"]},
            "webhooks": [{"stage": "post-planning", "url": "https://policy.local/check"}],
            "healthChecks": [
                {"name": "web", "type": "http", "url": "https://${{ .endpoint }}/health", "timeout": "5s"},
                {"name": "db", "type": "tcp", "address": "db.local:5432"}
            ]
        }),
    );
    assert!(validate_terraform(&tf).is_ok());
}

#[test]
fn test_empty_source_name_is_rejected() {
    let message = rejection(json!({"sourceRef": {"kind": "GitRepository", "name": " "}}));
    assert_eq!(message, "sourceRef.name cannot be empty");
}

#[test]
fn test_bad_durations_are_rejected() {
    let cases = [
        (json!({"interval": "5 minutes"}), "interval:"),
        (json!({"interval": "0s"}), "interval:"),
        (json!({"retryInterval": "soon"}), "retryInterval:"),
        (json!({"driftDetectionInterval": "10"}), "driftDetectionInterval:"),
    ];
    for (extra, prefix) in cases {
        let message = rejection(extra.clone());
        assert!(
            message.starts_with(prefix),
            "{extra} should fail with '{prefix}', got '{message}'"
        );
    }
}

#[test]
fn test_value_from_needs_exactly_one_reference() {
    let neither = rejection(json!({"vars": [{"name": "token", "valueFrom": {}}]}));
    assert!(neither.contains("vars[token].valueFrom must set exactly one"));

    let both = rejection(json!({"vars": [{"name": "token", "valueFrom": {
        "secretKeyRef": {"name": "api", "key": "token"},
        "configMapKeyRef": {"name": "api", "key": "token"}
    }}]}));
    assert!(both.contains("exactly one of secretKeyRef or configMapKeyRef"));
}

#[test]
fn test_malformed_output_entries_are_rejected() {
    for entry in ["", ":alias", "name:", "a:b:c"] {
        let message = rejection(json!({
            "writeOutputsToSecret": {"name": "outputs", "outputs": [entry]}
        }));
        assert!(
            message.contains("must be 'name' or 'name:alias'"),
            "entry '{entry}' gave '{message}'"
        );
    }
}

#[test]
fn test_webhook_url_must_be_http() {
    let message = rejection(json!({
        "webhooks": [{"stage": "post-planning", "url": "ftp://policy.local"}]
    }));
    assert_eq!(message, "webhooks: url 'ftp://policy.local' must be an http(s) URL");
}

#[test]
fn test_health_check_needs_a_target() {
    let http = rejection(json!({"healthChecks": [{"name": "web", "type": "http"}]}));
    assert_eq!(http, "healthChecks[web]: http check requires url");

    let tcp = rejection(json!({"healthChecks": [{"name": "db", "type": "tcp", "url": "http://db"}]}));
    assert_eq!(tcp, "healthChecks[db]: tcp check requires address");

    let timeout = rejection(json!({"healthChecks": [
        {"name": "db", "type": "tcp", "address": "db:5432", "timeout": "fast"}
    ]}));
    assert!(timeout.starts_with("healthChecks[db].timeout:"));
}
