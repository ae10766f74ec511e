//! Channel implementations.
//!
//! - [`tcp::TcpChannel`]: network transport, one listener for messages and one
//!   for data.
//! - [`ipc::IpcChannel`]: same-machine transport over Unix domain sockets
//!   (Unix only).
//! - [`memory::MemoryChannel`]: in-process transport for tests and embedding.

pub mod framing;
#[cfg(unix)]
pub mod ipc;
pub mod memory;
pub mod tcp;

use crate::error::{WireError, WireResult};
use crate::retry::{retry_async, RetryConfig, RetryOutcome};
use nodelink_types::EndpointId;
use std::future::Future;
use url::Url;

/// Whether a failed delivery attempt is worth repeating.
pub(crate) fn is_retryable(error: &WireError) -> bool {
    !matches!(
        error,
        WireError::Json(_)
            | WireError::MessageTooLarge { .. }
            | WireError::InvalidAddress(_)
            | WireError::TransferCancelled
            | WireError::DataRefused(_)
            | WireError::UnsupportedTemplate(_)
    )
}

/// Run a delivery with retries. Exhausted retries become [`WireError::SendFailed`];
/// errors that cannot be retried are returned as they are.
pub(crate) async fn deliver<F, Fut, T>(
    endpoint: &EndpointId,
    max_retries: u32,
    operation: F,
) -> WireResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WireResult<T>>,
{
    let config = RetryConfig::with_retries(max_retries);
    match retry_async(&config, operation, is_retryable).await {
        RetryOutcome::Success { result, .. } => Ok(result),
        RetryOutcome::Exhausted {
            last_error,
            attempts,
        } => {
            if is_retryable(&last_error) {
                Err(WireError::SendFailed {
                    endpoint: endpoint.clone(),
                    attempts,
                    reason: last_error.to_string(),
                })
            } else {
                Err(last_error)
            }
        }
    }
}

/// Host and port of a `tcp://host:port` address.
pub(crate) fn host_port(address: &Url) -> WireResult<(String, u16)> {
    let host = address
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| WireError::InvalidAddress(format!("{address}: missing host")))?;
    let port = address
        .port()
        .ok_or_else(|| WireError::InvalidAddress(format!("{address}: missing port")))?;
    // IPv6 hosts come back bracketed.
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}
