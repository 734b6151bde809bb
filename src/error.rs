//! Error Types

use crate::registry::ModelId;
use crate::runtime::SERVICE_PORT;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Container engine unreachable: {reason}")]
    EngineUnreachable { reason: String },

    #[error("Model not found: {0}")]
    ModelNotFound(ModelId),

    #[error("Failed to start container {unit}: {reason}")]
    StartFailed { unit: String, reason: String },

    #[error("Container {unit} is running but has no host port mapped for {port}/tcp", port = SERVICE_PORT)]
    NoPortAssigned { unit: String },

    #[error("Model returned error ({status}): {body}")]
    UpstreamError { status: u16, body: String },

    #[error("Model unavailable or not responding: {reason}")]
    UpstreamUnavailable { reason: String },

    #[error("Could not evict model {model_id} to free capacity: {reason}")]
    CapacityEvictionFailed { model_id: ModelId, reason: String },

    #[error("Image build failed: {tag} - {reason}")]
    BuildFailed { tag: String, reason: String },

    #[error("Engine operation failed: {operation} - {reason}")]
    EngineOperation { operation: String, reason: String },

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Event log error: {0}")]
    EventLog(String),

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Error::EngineUnreachable {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Error::EngineUnreachable { .. } => "engine_unreachable",
            Error::ModelNotFound(_) => "model_not_found",
            Error::StartFailed { .. } => "start_failed",
            Error::NoPortAssigned { .. } => "no_port_assigned",
            Error::UpstreamError { .. } => "upstream_error",
            Error::UpstreamUnavailable { .. } => "upstream_unavailable",
            Error::CapacityEvictionFailed { .. } => "capacity_eviction_failed",
            Error::BuildFailed { .. } => "build_failed",
            Error::EngineOperation { .. } => "engine_operation_failed",
            Error::Registry(_) => "registry_error",
            Error::EventLog(_) => "event_log_error",
            Error::InvalidConfig { .. } => "invalid_config",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Other(_) => "other",
        }
    }

    /// HTTP status a caller of the inference API should see for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::ModelNotFound(_) => 404,
            Error::UpstreamError { status, .. } => *status,
            Error::UpstreamUnavailable { .. }
            | Error::EngineUnreachable { .. }
            | Error::CapacityEvictionFailed { .. } => 503,
            Error::StartFailed { .. } | Error::NoPortAssigned { .. } => 502,
            Error::InvalidConfig { .. } => 400,
            _ => 500,
        }
    }

    /// Whether retrying the same request later may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::UpstreamUnavailable { .. }
                | Error::EngineUnreachable { .. }
                | Error::CapacityEvictionFailed { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Registry(err.to_string())
    }
}
