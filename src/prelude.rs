//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ## Usage
//!
//! ```rust
//! use tf_controller::prelude::*;
//! ```
//!
//! This brings into scope:
//! - All CRD types (Terraform, TerraformSpec, TerraformStatus, etc.)
//! - Collaborator traits (StatusStore, RunnerRuntime, ExecutionSession, ...)
//! - Reconciler types (Reconciler, ReconcilerError, Decision, etc.)
//! - Config types (ControllerConfig)

// CRD types - most commonly used
pub use crate::crd::*;

// Collaborator traits - implemented by the Kubernetes clients and by test fakes
pub use crate::controller::runner::{RunnerError, RunnerHandle, RunnerRuntime};
pub use crate::controller::secrets::{SecretsClient, SecretsError};
pub use crate::controller::session::{ExecutionSession, SessionError, SessionFactory};
pub use crate::controller::source::{SourceArtifact, SourceResolver, SourceState};
pub use crate::controller::store::{ObjectKey, StatusStore, StoreError};
pub use crate::controller::webhook::{GateDecision, WebhookGate};

// Reconciler types - core controller functionality
pub use crate::controller::reconciler::{
    reconcile, BackoffState, Collaborators, Decision, Reconciler, ReconcilerError,
};

// Config types - for configuration management
pub use crate::config::ControllerConfig;
