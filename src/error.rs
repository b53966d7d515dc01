//! Bifrost error types

use std::time::Duration;

/// Bifrost error types
#[derive(Debug, thiserror::Error)]
pub enum BifrostError {
    // Startup errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to bind listener {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("protocol error in {path}: {message}")]
    Protocol { path: String, message: String },

    #[error("service already registered: {0}")]
    DuplicateService(String),

    #[error("method already registered: {0}")]
    DuplicateMethod(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    // Worker errors
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("no worker available within {0:?}")]
    NoWorker(Duration),

    #[error("worker pool failed: {0}")]
    PoolFailed(String),

    #[error("worker pool is stopped")]
    PoolStopped,

    #[error("malformed worker response: {0}")]
    MalformedResponse(String),

    /// Application error reported by the worker for one call.
    #[error("worker error ({code}): {message}")]
    Worker { code: i32, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    // Client errors
    #[error("rpc failed ({code:?}): {message}")]
    Rpc { code: tonic::Code, message: String },

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BifrostError> for tonic::Status {
    fn from(err: BifrostError) -> Self {
        let message = err.to_string();
        match err {
            BifrostError::Worker { code, message } => {
                tonic::Status::new(tonic::Code::from_i32(code), message)
            }
            BifrostError::Rpc { code, message } => tonic::Status::new(code, message),
            BifrostError::Timeout(_) => tonic::Status::deadline_exceeded(message),
            BifrostError::NoWorker(_) => tonic::Status::resource_exhausted(message),
            BifrostError::WorkerCrashed(_)
            | BifrostError::PoolFailed(_)
            | BifrostError::PoolStopped => tonic::Status::unavailable(message),
            BifrostError::InvalidState(_) => tonic::Status::failed_precondition(message),
            _ => tonic::Status::internal(message),
        }
    }
}

/// Result type alias for Bifrost operations
pub type Result<T> = std::result::Result<T, BifrostError>;
