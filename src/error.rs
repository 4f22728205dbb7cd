use serde::Serialize;
use thiserror::Error;

/// Coarse classification of a rejected command, reported back to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    /// Malformed or unroutable command. Not retried.
    Rejected,
    /// No connected node covers a required environment.
    Allocation,
    /// Another node holds the advisory edit lock. Retry after backoff.
    Locked,
    /// Per-instance request rate exceeded.
    RateLimited,
    /// Storage or internal failure.
    Failed,
}

/// Errors returned synchronously to the node that issued a command.
///
/// Task-scoped failures (a task whose `error` field is set) are not
/// represented here: they are routed asynchronously to an error handler task.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("malformed command: {0}")]
    Protocol(String),

    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("node {0} is not registered")]
    UnknownNode(String),

    #[error("no active task {0}")]
    NotFound(String),

    #[error("template {0} not found")]
    TemplateNotFound(String),

    #[error("invalid template {template_id}: {reason}")]
    InvalidTemplate { template_id: String, reason: String },

    #[error("no node found for environment {environment} (template {template_id})")]
    Allocation {
        template_id: String,
        environment: String,
    },

    #[error("task {instance_id} locked by {holder}")]
    Locked { instance_id: String, holder: String },

    #[error("task {instance_id} update rate exceeded {limit} per minute")]
    RateLimited { instance_id: String, limit: u32 },

    #[error("user {user_id} may not start {template_id}")]
    PermissionDenied { template_id: String, user_id: String },

    #[error("hub error rate exceeded {0} per minute")]
    ErrorStorm(u32),

    #[error("hub halted after storage failure")]
    Halted,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl HubError {
    pub fn status(&self) -> Status {
        match self {
            HubError::Protocol(_)
            | HubError::UnknownCommand(_)
            | HubError::UnknownNode(_)
            | HubError::NotFound(_)
            | HubError::TemplateNotFound(_)
            | HubError::InvalidTemplate { .. }
            | HubError::PermissionDenied { .. }
            | HubError::ErrorStorm(_) => Status::Rejected,
            HubError::Allocation { .. } => Status::Allocation,
            HubError::Locked { .. } => Status::Locked,
            HubError::RateLimited { .. } => Status::RateLimited,
            HubError::Halted | HubError::Storage(_) => Status::Failed,
        }
    }

    /// Lock conflicts and rate rejections clear up on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(self.status(), Status::Locked | Status::RateLimited)
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Protocol(e.to_string())
    }
}

pub type HubResult<T> = Result<T, HubError>;
