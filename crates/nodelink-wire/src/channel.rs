//! The transport seam: what the protocol layer needs from a channel.
//!
//! A [`Channel`] owns one message/data transport pair for a single
//! [`ChannelTemplate`]. Inbound traffic is pushed into an [`InboundSink`]
//! handed over when the channel opens.

use crate::error::WireResult;
use crate::message::WireMessage;
use async_trait::async_trait;
use nodelink_types::{ChannelTemplate, EndpointId, EndpointInformation, MessageId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use url::Url;

/// Cancellation signal for data transfers; `true` means cancelled.
pub type CancelSignal = watch::Receiver<bool>;

/// A signal that never fires, for transfers that cannot be cancelled.
pub fn never_cancelled() -> CancelSignal {
    let (_tx, rx) = watch::channel(false);
    rx
}

/// Resolves once `cancel` reads `true`. A dropped sender means the transfer
/// can no longer be cancelled, so the future then stays pending.
pub(crate) async fn cancelled(mut cancel: CancelSignal) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Addresses a channel listens on once open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAddresses {
    pub message_address: Url,
    pub data_address: Url,
}

/// Frame sent ahead of the bytes of a data transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataHeader {
    pub sender: EndpointId,
    pub id: MessageId,
    /// Download request this transfer answers, or [`MessageId::NONE`].
    pub in_response_to: MessageId,
    pub file_name: String,
    pub length: u64,
}

/// Receiver of inbound traffic.
pub trait InboundSink: Send + Sync + 'static {
    fn message_received(&self, message: WireMessage);

    /// Checked before any byte of a transfer is written to disk.
    fn accepts_data(&self, _header: &DataHeader) -> bool {
        true
    }

    /// A data transfer finished and its bytes are stored at `path`.
    fn data_received(&self, header: DataHeader, path: PathBuf);
}

/// One transport channel.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    fn template(&self) -> ChannelTemplate;

    /// Start listening; inbound traffic goes to `sink` until [`Channel::close`].
    async fn open(&self, sink: Arc<dyn InboundSink>) -> WireResult<ChannelAddresses>;

    async fn close(&self) -> WireResult<()>;

    /// Deliver a message, retrying up to `max_retries` times.
    async fn send(
        &self,
        to: &EndpointInformation,
        message: &WireMessage,
        max_retries: u32,
    ) -> WireResult<()>;

    /// Stream the file at `path` to the endpoint's data address.
    async fn transfer_data(
        &self,
        to: &EndpointInformation,
        header: DataHeader,
        path: &Path,
        cancel: CancelSignal,
        max_retries: u32,
    ) -> WireResult<()>;

    /// Drop any cached state (connections) for a departed endpoint.
    fn endpoint_disconnected(&self, id: &EndpointId);
}

/// File name component of `path`, used in data headers.
pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string())
}

/// Destination for an inbound transfer: `<dir>/<header id>-<file name>`.
pub(crate) fn download_path(dir: &Path, header: &DataHeader) -> PathBuf {
    let name = Path::new(&header.file_name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string());
    dir.join(format!("{}-{}", header.id, name))
}
