//! # Runtime
//!
//! Process wiring for the controller binary.
//!
//! - `initialization`: rustls, tracing, metrics, probe server, Kubernetes clients
//! - `watch_loop`: the `kube-runtime` controller stream and its restarts
//! - `error_policy`: requeue policy for reconcile errors and watch stream errors

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;
