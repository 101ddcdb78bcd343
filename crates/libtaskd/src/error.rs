use taskd_protocol::{ErrorCode, TaskId, TaskStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("cannot {op} task {id} while it is {status}")]
    InvalidState {
        id: TaskId,
        status: TaskStatus,
        op: &'static str,
    },

    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("failed to archive output: {0}")]
    Archive(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    pub fn invalid_state(id: &str, status: TaskStatus, op: &'static str) -> Self {
        TaskError::InvalidState {
            id: id.to_string(),
            status,
            op,
        }
    }

    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            TaskError::NotFound(_) => (ErrorCode::NotFound, self.to_string()),
            TaskError::InvalidState { .. } => (ErrorCode::InvalidState, self.to_string()),
            TaskError::AlreadyExists(_) => (ErrorCode::AlreadyExists, self.to_string()),
            TaskError::ResourceExhausted(_) => (ErrorCode::ResourceExhausted, self.to_string()),
            TaskError::InvalidRequest(_) => (ErrorCode::InvalidRequest, self.to_string()),
            TaskError::Spawn(_) => (ErrorCode::ServerError, self.to_string()),
            TaskError::Archive(_) => (ErrorCode::ServerError, self.to_string()),
            TaskError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }
}
