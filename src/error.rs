use thiserror::Error;

/// Errors surfaced by the aggregation pipeline's in-process API.
///
/// Startup-time failures (`RoleNotFound`, `DuplicateRole`) indicate a wiring
/// mistake and should abort the process. Everything else is reported to the
/// caller of the operation that raised it.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no worker registered for role {0}")]
    RoleNotFound(String),

    #[error("role {0} is already registered")]
    DuplicateRole(String),

    #[error("ask is not supported by async worker {role}[{replica}]")]
    UnsupportedAsk { role: String, replica: usize },

    #[error("queue for {role}[{replica}] is closed")]
    QueueClosed { role: String, replica: usize },

    #[error("window already has a held buffer")]
    WindowAlreadyHeld,

    #[error("invalid time bucket {0}")]
    InvalidTimeBucket(i64),

    #[error("column {column} is not declared for stream {stream}")]
    UnknownColumn { stream: String, column: String },

    #[error("column {column} expects {expected}, got {got}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("role {role} cannot handle {message} messages")]
    UnsupportedMessage { role: String, message: &'static str },

    #[error(transparent)]
    Job(#[from] anyhow::Error),
}
