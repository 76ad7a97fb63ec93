//! # Observability
//!
//! Prometheus metrics for the controller. Structured logs go through
//! `tracing` and are configured in `runtime::initialization`.

pub mod metrics;
