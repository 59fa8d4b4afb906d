use thiserror::Error;

/// Engine-level failures. Absence ("run not found", "no candidate worker")
/// is not an error here: those outcomes flow back as `Option`/`bool` from
/// the store and directory, and callers branch on them. What remains is
/// infrastructure that failed underneath us.
#[derive(Error, Debug)]
pub enum TaskherdError {
    #[error("Coordination store error: {0}")]
    Coordination(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TaskherdError>;
