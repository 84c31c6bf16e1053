//! Error types for command routing.
//!
//! Every error surfaced by the router is a server-side error. Callers can
//! use [`RouterError::status_code`] to classify it.

use neomind_messaging::MessagingError;
use thiserror::Error;

/// Result type for command routing operations.
pub type Result<T> = std::result::Result<T, RouterError>;

/// Status code for errors the caller may retry once the service recovers.
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

/// Status code for all other server-side errors.
pub const STATUS_INTERNAL_ERROR: u16 = 500;

/// Command routing error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("Command router not initialized")]
    NotInitialized,

    #[error("Command router already initialized")]
    AlreadyInitialized,

    #[error("Messaging network unavailable: {0}")]
    Unavailable(String),

    #[error("Link construction failed: {0}")]
    ConstructionFailed(String),

    #[error("No adapter instance found for device '{device_id}' of tenant '{tenant_id}'")]
    ResolutionFailed { tenant_id: String, device_id: String },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl RouterError {
    /// Get the server-side status classification.
    pub fn status_code(&self) -> u16 {
        match self {
            RouterError::NotInitialized | RouterError::Unavailable(_) => {
                STATUS_SERVICE_UNAVAILABLE
            }
            _ => STATUS_INTERNAL_ERROR,
        }
    }

    /// Check if retrying later may succeed without caller action.
    pub fn is_transient(&self) -> bool {
        self.status_code() == STATUS_SERVICE_UNAVAILABLE
    }
}

impl From<MessagingError> for RouterError {
    fn from(err: MessagingError) -> Self {
        if err.is_connection_error() {
            return RouterError::Unavailable(err.to_string());
        }
        match err {
            MessagingError::LinkOpenFailed { .. } => {
                RouterError::ConstructionFailed(err.to_string())
            }
            _ => RouterError::SendFailed(err.to_string()),
        }
    }
}
