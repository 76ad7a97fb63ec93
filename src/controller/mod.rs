//! # Controller
//!
//! Core controller modules for the Terraform controller.
//!
//! - `backoff`: Exponential backoff for transient retries
//! - `dependency`: `dependsOn` readiness and cycle detection
//! - `health`: Post-apply TCP and HTTP health checks
//! - `lock`: State lock discipline and force-unlock
//! - `reconciler`: Per-resource reconciliation state machine
//! - `runner`: Runner pod lifecycle
//! - `secrets`: Variable sources, outputs secret and readable plans
//! - `server`: HTTP server for metrics and health checks
//! - `session`: Execution session against a runner
//! - `source`: Flux source artifact resolution
//! - `store`: Status store with optimistic concurrency
//! - `template`: `${{ .path }}` expression templates
//! - `webhook`: Policy webhook gate

pub mod backoff;
pub mod dependency;
pub mod health;
pub mod lock;
pub mod reconciler;
pub mod runner;
pub mod secrets;
pub mod server;
pub mod session;
pub mod source;
pub mod store;
pub mod template;
pub mod webhook;
