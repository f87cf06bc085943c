//! Pipeline error types.
//!
//! Low confidence, missing parameters and expired tokens are ordinary
//! outcomes and never show up here. Only conditions that leave the pipeline
//! unable to make a safe decision are errors.

use uuid::Uuid;

use crate::services::ServiceError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Session / token / transition / sample store failure.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("permission denied: role {role} may not run {tool}")]
    PermissionDenied { tool: String, role: String },

    #[error("invalid preview token: {0}")]
    InvalidToken(String),

    #[error("conversation session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("unknown intent: {0}")]
    UnknownIntent(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Writes only run through a confirmed preview token.
    #[error("tool {0} mutates business state and must go through preview")]
    MutationRequiresPreview(String),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
