//! # Configuration
//!
//! Controller-level configuration loaded from environment variables.
//!
//! Per-resource settings (intervals, approval mode, runner overrides) live on
//! the `Terraform` spec; everything here is process-wide.

mod controller;

pub use controller::ControllerConfig;
