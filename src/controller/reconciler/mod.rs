//! # Reconciler
//!
//! Per-resource reconciliation state machine for `Terraform` resources.
//!
//! Every tick reads the freshest object, decides one transition from its
//! status and the observed world, and performs it. Each step that changes
//! state ends in a status patch, so a tick interrupted anywhere resumes from
//! the last persisted phase.
//!
//! ## Tick Flow
//!
//! 1. Lifecycle: deletion, suspension, retry wait, force-unlock
//! 2. Finalizer and spec validation
//! 3. Source artifact and (while initializing) dependencies
//! 4. Decide: plan, apply, await approval or idle
//! 5. Run the transition through a runner pod and its execution session
//!
//! Failures land in a single place (`reconcile::fail`) that classifies them
//! as transient or semantic and schedules the retry.

pub mod finalize;
pub mod inputs;
pub mod phase;
pub mod reconcile;
pub mod status;
pub mod types;
pub mod validation;

pub use phase::{
    decide, lifecycle_decision, next_plan_id, spec_fingerprint, Decision, Lifecycle, Observation,
    PlanTrigger, Schedule,
};
pub use reconcile::reconcile;
pub use types::{BackoffState, Collaborators, Reconciler, ReconcilerError};
