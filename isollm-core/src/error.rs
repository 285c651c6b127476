//! Error taxonomy shared across components.
//!
//! Every fallible operation returns `anyhow::Result`, but the underlying
//! sentinel is always one of the variants below so callers can match on
//! *kind* rather than message text — `anyhow::Error::downcast_ref` recovers
//! the sentinel through any number of `.context(...)` wrapping layers.

use thiserror::Error;

/// Semantic error kinds surfaced by the queue client, git hub, and worker
/// manager. Never matched on by rendered message — always by variant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IsollmError {
    #[error("task '{0}' not found")]
    TaskNotFound(String),

    #[error("task '{0}' is already claimed")]
    AlreadyClaimed(String),

    #[error("not the owner of task '{0}'")]
    NotOwner(String),

    #[error("invalid transition for task '{0}': {1}")]
    InvalidTransition(String, String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("dependency cycle detected involving task '{0}'")]
    CycleDetected(String),

    #[error("dependency '{0}' -> '{1}' not found")]
    DependencyNotFound(String, String),

    #[error("task queue server is not running")]
    ServerNotRunning,

    #[error("task queue server is unhealthy: {0}")]
    ServerUnhealthy(String),

    #[error("project '{0}' not found")]
    ProjectNotFound(String),

    #[error("git command failed: {0}")]
    GitFailed(String),

    #[error("failed to create hub at {0}")]
    HubCreateFailed(String),
}

impl IsollmError {
    /// True if `err` (or something it wraps) is `TaskNotFound`.
    pub fn is_task_not_found(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<IsollmError>(),
            Some(IsollmError::TaskNotFound(_))
        )
    }

    /// True if `err` (or something it wraps) is `AlreadyClaimed`.
    pub fn is_already_claimed(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<IsollmError>(),
            Some(IsollmError::AlreadyClaimed(_))
        )
    }

    /// True if `err` (or something it wraps) is `NotOwner`.
    pub fn is_not_owner(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<IsollmError>(),
            Some(IsollmError::NotOwner(_))
        )
    }

    /// True if `err` (or something it wraps) indicates the queue server is
    /// unreachable or unhealthy.
    pub fn is_server_unavailable(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<IsollmError>(),
            Some(IsollmError::ServerNotRunning) | Some(IsollmError::ServerUnhealthy(_))
        )
    }
}

/// Render the canonical single-line user-facing message for common
/// external-unavailable conditions (§7).
pub fn canonical_message(err: &anyhow::Error) -> Option<&'static str> {
    if IsollmError::is_server_unavailable(err) {
        return Some("Airyra server is not running. Start it with: airyra server start");
    }
    None
}
