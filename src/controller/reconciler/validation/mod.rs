//! # Validation
//!
//! Validates Terraform resources and duration strings.

mod duration;
mod spec;

pub use duration::parse_kubernetes_duration;
pub use spec::validate_terraform;
