//! Session tests against a local runner API

mod common;

use axum::routing::{get, post};
use axum::{Json, Router};
use common::*;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tf_controller::controller::runner::RunnerHandle;
use tf_controller::controller::session::{
    ApplyRequest, ExecutionSession, HttpSessionFactory, PlanRequest, SessionError, SessionFactory,
};

const SLOW: Duration = Duration::from_millis(400);
const COMMAND_TIMEOUT: Duration = Duration::from_millis(100);

async fn runner_server() -> SocketAddr {
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/v1/plan",
            post(|| async {
                tokio::time::sleep(SLOW).await;
                Json(json!({"hasChanges": true, "isDestroy": false, "planId": PLAN_ID}))
            }),
        )
        .route(
            "/v1/apply",
            post(|| async {
                tokio::time::sleep(SLOW).await;
                Json(json!({
                    "inventory": [{"name": "hello", "type": "aws_s3_bucket", "identifier": "hello-bucket"}]
                }))
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn runner(addr: SocketAddr) -> RunnerHandle {
    RunnerHandle {
        pod_name: "hello-world-tf-runner".to_string(),
        uid: "uid-runner".to_string(),
        endpoint: format!("http://{addr}"),
    }
}

#[tokio::test]
async fn test_slow_plan_hits_the_command_timeout() {
    init_rustls();
    let addr = runner_server().await;
    let factory = HttpSessionFactory::new(Duration::from_secs(1), COMMAND_TIMEOUT);
    let session = factory.connect(&runner(addr)).await.unwrap();

    let result = session
        .plan(&PlanRequest {
            plan_id: PLAN_ID.to_string(),
            ..Default::default()
        })
        .await;

    assert!(matches!(result, Err(SessionError::Timeout(limit)) if limit == COMMAND_TIMEOUT));
}

#[tokio::test]
async fn test_apply_outlasts_the_command_timeout() {
    init_rustls();
    let addr = runner_server().await;
    let factory = HttpSessionFactory::new(Duration::from_secs(1), COMMAND_TIMEOUT);
    let session = factory.connect(&runner(addr)).await.unwrap();

    let result = session
        .apply(&ApplyRequest {
            plan_id: PLAN_ID.to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(result.inventory.len(), 1);
    assert_eq!(result.inventory[0].identifier, "hello-bucket");
}
