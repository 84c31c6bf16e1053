//! Error types for the messaging network.

use thiserror::Error;

use crate::delivery::DeliveryOutcome;

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised by connections, links and deliveries.
#[derive(Debug, Clone, Error)]
pub enum MessagingError {
    /// The connection to the messaging network is down.
    #[error("Not connected to the messaging network")]
    NotConnected,

    /// The connection did not become live in time.
    #[error("Connection check timed out after {0}ms")]
    Timeout(u64),

    /// The peer refused or failed to open a link.
    #[error("Failed to open link on '{address}': {reason}")]
    LinkOpenFailed { address: String, reason: String },

    /// The link was closed before the operation completed.
    #[error("Link closed: {0}")]
    LinkClosed(String),

    /// The message could not be transferred.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The peer settled the message with an outcome other than accepted.
    #[error("Message not accepted by peer: {0}")]
    NotAccepted(DeliveryOutcome),

    /// A delivery was settled more than once.
    #[error("Delivery already settled")]
    AlreadySettled,
}

impl MessagingError {
    /// Check if the error means the connection itself is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, MessagingError::NotConnected | MessagingError::Timeout(_))
    }
}
