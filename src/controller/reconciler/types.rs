//! # Types
//!
//! Core types for the reconciler.

use crate::config::ControllerConfig;
use crate::controller::backoff::ExponentialBackoff;
use crate::controller::health::HealthChecker;
use crate::controller::runner::{RunnerError, RunnerRuntime};
use crate::controller::secrets::{SecretsClient, SecretsError};
use crate::controller::session::{LockInfo, SessionError, SessionFactory};
use crate::controller::source::{SourceError, SourceResolver};
use crate::controller::store::{ObjectKey, StatusStore, StoreError};
use crate::controller::webhook::WebhookGate;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

/// Failure of a reconciliation tick
///
/// Transient kinds are retried with exponential backoff and only surface as
/// `Ready=False` after repeated occurrences. Semantic kinds surface at once
/// and wait at least `retryInterval`.
#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("{0}")]
    Transient(String),
    #[error("runner session unavailable: {0}")]
    SessionUnavailable(String),
    /// Contact with the runner was lost while it was applying
    #[error("apply interrupted: {0}")]
    ApplyInterrupted(String),
    #[error("{message}")]
    ExecutionFailed {
        message: String,
        lock: Option<LockInfo>,
    },
    #[error("{reason}")]
    PolicyDenied { reason: String, retry: bool },
    #[error("invalid spec: {0}")]
    Invalid(String),
    #[error("state lock held by '{holder}'")]
    Locked { holder: String },
    #[error("status update conflicted: {0}")]
    Conflict(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("status store: {0}")]
    Store(StoreError),
}

impl ReconcilerError {
    /// Condition reason recorded for this failure
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcilerError::Transient(_) => "TransientError",
            ReconcilerError::SessionUnavailable(_) => "SessionUnavailable",
            ReconcilerError::ApplyInterrupted(_) => "ApplyInterrupted",
            ReconcilerError::ExecutionFailed { .. } => "ExecutionFailed",
            ReconcilerError::PolicyDenied { .. } => "PolicyDenied",
            ReconcilerError::Invalid(_) => "InvalidSpec",
            ReconcilerError::Locked { .. } => "StateLocked",
            ReconcilerError::Conflict(_) => "Conflict",
            ReconcilerError::Cancelled(_) => "Cancelled",
            ReconcilerError::Store(_) => "StoreError",
        }
    }

    /// Retried with backoff instead of surfacing at once
    ///
    /// A policy denial with `retry` set means the webhook could not be
    /// consulted, which is an infrastructure problem rather than a verdict.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcilerError::Transient(_)
            | ReconcilerError::SessionUnavailable(_)
            | ReconcilerError::ApplyInterrupted(_)
            | ReconcilerError::Conflict(_)
            | ReconcilerError::Store(_) => true,
            ReconcilerError::PolicyDenied { retry, .. } => *retry,
            ReconcilerError::ExecutionFailed { .. }
            | ReconcilerError::Invalid(_)
            | ReconcilerError::Locked { .. }
            | ReconcilerError::Cancelled(_) => false,
        }
    }
}

impl From<StoreError> for ReconcilerError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::ConflictRetriesExhausted { .. } | StoreError::Conflict(_) => {
                ReconcilerError::Conflict(error.to_string())
            }
            other => ReconcilerError::Store(other),
        }
    }
}

impl From<SessionError> for ReconcilerError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Unavailable(message) => ReconcilerError::SessionUnavailable(message),
            SessionError::Timeout(_) => ReconcilerError::Transient(error.to_string()),
            SessionError::ExecutionFailed { message, lock_info } => {
                ReconcilerError::ExecutionFailed {
                    message,
                    lock: lock_info,
                }
            }
        }
    }
}

impl From<RunnerError> for ReconcilerError {
    fn from(error: RunnerError) -> Self {
        ReconcilerError::Transient(error.to_string())
    }
}

impl From<SourceError> for ReconcilerError {
    fn from(error: SourceError) -> Self {
        match error {
            SourceError::Invalid(message) => ReconcilerError::Invalid(message),
            kube @ SourceError::Kube { .. } => ReconcilerError::Transient(kube.to_string()),
        }
    }
}

impl From<SecretsError> for ReconcilerError {
    fn from(error: SecretsError) -> Self {
        match error {
            SecretsError::NotFound { .. } | SecretsError::MissingKey { .. } => {
                ReconcilerError::Invalid(error.to_string())
            }
            SecretsError::Kube(_) | SecretsError::Backend(_) => {
                ReconcilerError::Transient(error.to_string())
            }
        }
    }
}

/// Backoff state for a specific resource
/// Tracks consecutive failures and the retry schedule they follow
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: ExponentialBackoff,
    pub error_count: u32,
}

impl BackoffState {
    #[must_use]
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            backoff,
            error_count: 0,
        }
    }

    /// Record a failure and return the delay before the next attempt
    pub fn increment_error(&mut self) -> std::time::Duration {
        self.error_count += 1;
        self.backoff.delay(self.error_count)
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Everything the state machine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn StatusStore>,
    pub runners: Arc<dyn RunnerRuntime>,
    pub sessions: Arc<dyn SessionFactory>,
    pub sources: Arc<dyn SourceResolver>,
    pub secrets: Arc<dyn SecretsClient>,
    pub webhooks: Arc<dyn WebhookGate>,
    pub health: Arc<dyn HealthChecker>,
}

#[derive(Clone)]
pub struct Reconciler {
    pub collaborators: Collaborators,
    pub config: ControllerConfig,
    // Backoff state per resource (identified by namespace/name)
    pub backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
    // One tick at a time per resource; watch events and timer requeues race otherwise
    pub tick_locks: Arc<Mutex<HashMap<ObjectKey, Arc<AsyncMutex<()>>>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("instance_id", &self.config.instance_id)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(collaborators: Collaborators, config: ControllerConfig) -> Self {
        Self {
            collaborators,
            config,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
            tick_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get or create the tick lock of a resource
    /// Returns a mutex whose guard must be held for the whole tick
    pub fn tick_lock(&self, key: &ObjectKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .tick_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Record a transient failure of `key`, returning the backoff delay
    pub fn record_transient_failure(&self, key: &ObjectKey) -> std::time::Duration {
        let mut states = self
            .backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        states
            .entry(key.to_string())
            .or_insert_with(|| BackoffState::new(self.config.backoff()))
            .increment_error()
    }

    /// Forget the failure history of `key`; returns whether it had any
    pub fn reset_backoff(&self, key: &ObjectKey) -> bool {
        let mut states = self
            .backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match states.get_mut(&key.to_string()) {
            Some(state) => {
                let had_errors = state.error_count > 0;
                state.reset();
                had_errors
            }
            None => false,
        }
    }

    /// Drop all per-resource bookkeeping after the object is gone
    pub fn forget(&self, key: &ObjectKey) {
        self.backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key.to_string());
        self.tick_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}
