//! Terraform Controller Library
//!
//! Core functionality for the Terraform controller: the `Terraform` custom
//! resource, the per-resource reconciliation state machine, the runner pod
//! manager and its execution sessions, the state lock discipline, the
//! dependency resolver and the webhook gate.
//!
//! ## Quick Start
//!
//! ```rust
//! use tf_controller::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod runtime;
