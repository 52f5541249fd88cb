use thiserror::Error;

/// Failures a caller branches on. Everything else travels as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("no uploadable artifacts found for PR #{pr} at {sha}")]
    NoArtifacts { pr: u64, sha: String },

    #[error("posting a comment on #{issue} was rejected: {reason}")]
    CommentRejected { issue: u64, reason: String },

    #[error("missing credential: {0} is not set")]
    MissingCredential(&'static str),

    #[error("{command} exited with {status}")]
    ToolFailed { command: String, status: String },

    #[error("invalid trigger payload: {0}")]
    InvalidEvent(String),
}

/// Result of a call whose failure is ambiguous rather than fatal.
///
/// Callers decide per site whether `NotFound` and `Transient` are ignored,
/// logged, or propagated.
#[derive(Debug)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    Transient(anyhow::Error),
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound | Lookup::Transient(_) => None,
        }
    }
}

impl<T> From<anyhow::Result<Option<T>>> for Lookup<T> {
    fn from(result: anyhow::Result<Option<T>>) -> Self {
        match result {
            Ok(Some(value)) => Lookup::Found(value),
            Ok(None) => Lookup::NotFound,
            Err(err) => Lookup::Transient(err),
        }
    }
}

/// Exit status the binary reports for an error chain.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<BotError>() {
        Some(BotError::CommentRejected { .. }) => 1,
        Some(BotError::InvalidEvent(_)) => 2,
        _ => 1,
    }
}
