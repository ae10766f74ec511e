//! Errors from the protocol layer.

use nodelink_types::{ChannelTemplate, EndpointId, UploadToken};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// No connection information is known for the target endpoint.
    #[error("Endpoint {0} is not contactable")]
    EndpointNotContactable(EndpointId),
    /// Delivery failed after all configured retries.
    #[error("Failed to send to {endpoint} after {attempts} attempts: {reason}")]
    SendFailed {
        endpoint: EndpointId,
        attempts: u32,
        reason: String,
    },
    /// The awaited responder disconnected or the local channel closed.
    #[error("Response cancelled: the remote endpoint is gone or the channel closed")]
    ResponseCancelled,
    #[error("No response within {0:?}")]
    ResponseTimedOut(Duration),
    /// The remote endpoint answered with a failure message.
    #[error("Remote failure: {0}")]
    RemoteFailure(String),
    /// The remote endpoint answered with a message of an unexpected kind.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("No open channel for template {0}")]
    ChannelNotOpen(ChannelTemplate),
    #[error("Channel template {0} is not supported on this platform")]
    UnsupportedTemplate(ChannelTemplate),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Path already registered for upload: {0}")]
    UploadAlreadyRegistered(PathBuf),
    #[error("Unknown upload token: {0}")]
    UnknownUploadToken(UploadToken),
    #[error("Data transfer cancelled")]
    TransferCancelled,
    /// The receiver would not take a transfer from this sender or of this size.
    #[error("Data from {0} refused")]
    DataRefused(EndpointId),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl WireError {
    /// True when a wait ended because the peer vanished or the channel closed,
    /// as opposed to a delivered failure or a transport fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, WireError::ResponseCancelled)
    }
}

/// Alias for wire results.
pub type WireResult<T> = Result<T, WireError>;
