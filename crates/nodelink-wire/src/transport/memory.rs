//! In-process channel.
//!
//! Every [`MemoryChannel`] registers its addresses on a shared
//! [`MemoryNetwork`]. Messages still go through JSON so they exercise the
//! same serialization as the stream transports, and each channel drains its
//! inbound queue on its own task so delivery order is preserved.

use super::deliver;
use crate::channel::{
    cancelled, download_path, CancelSignal, Channel, ChannelAddresses, DataHeader, InboundSink,
};
use crate::error::{WireError, WireResult};
use crate::message::WireMessage;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use nodelink_types::{ChannelTemplate, EndpointId, EndpointInformation};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

enum Inbound {
    Message(WireMessage),
    Data(DataHeader, PathBuf),
}

#[derive(Clone)]
struct Mailbox {
    node: String,
    queue: mpsc::UnboundedSender<Inbound>,
    download_dir: PathBuf,
    sink: Arc<dyn InboundSink>,
}

/// Address space shared by in-process channels.
#[derive(Default)]
pub struct MemoryNetwork {
    mailboxes: DashMap<Url, Mailbox>,
    unreachable: DashSet<String>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Cut (or restore) all traffic to and from the node called `name`.
    pub fn set_reachable(&self, name: &str, reachable: bool) {
        if reachable {
            self.unreachable.remove(name);
        } else {
            self.unreachable.insert(name.to_string());
        }
    }

    pub fn is_reachable(&self, name: &str) -> bool {
        !self.unreachable.contains(name)
    }

    fn route(&self, from: &str, address: &Url) -> WireResult<Mailbox> {
        let mailbox = self
            .mailboxes
            .get(address)
            .map(|m| m.value().clone())
            .ok_or(WireError::ConnectionClosed)?;
        if !self.is_reachable(from) || !self.is_reachable(&mailbox.node) {
            return Err(WireError::ConnectionClosed);
        }
        Ok(mailbox)
    }
}

struct Registered {
    addresses: ChannelAddresses,
    drain: JoinHandle<()>,
}

/// Channel on a [`MemoryNetwork`]. Addresses look like `ipc://<name>/messages`,
/// using the scheme of the chosen template.
pub struct MemoryChannel {
    network: Arc<MemoryNetwork>,
    name: String,
    template: ChannelTemplate,
    download_dir: PathBuf,
    registered: Mutex<Option<Registered>>,
}

impl MemoryChannel {
    pub fn new(
        network: Arc<MemoryNetwork>,
        name: impl Into<String>,
        template: ChannelTemplate,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            network,
            name: name.into(),
            template,
            download_dir: download_dir.into(),
            registered: Mutex::new(None),
        }
    }

    fn address(&self, kind: &str) -> WireResult<Url> {
        let raw = format!("{}://{}/{}", self.template.scheme(), self.name, kind);
        Url::parse(&raw).map_err(|e| WireError::InvalidAddress(format!("{raw}: {e}")))
    }

    fn target<'a>(address: &'a Option<Url>, to: &EndpointInformation) -> WireResult<&'a Url> {
        address
            .as_ref()
            .ok_or_else(|| WireError::EndpointNotContactable(to.id.clone()))
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn template(&self) -> ChannelTemplate {
        self.template
    }

    async fn open(&self, sink: Arc<dyn InboundSink>) -> WireResult<ChannelAddresses> {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(registered) = registered.as_ref() {
            return Ok(registered.addresses.clone());
        }

        let addresses = ChannelAddresses {
            message_address: self.address("messages")?,
            data_address: self.address("data")?,
        };
        let (queue, mut inbox) = mpsc::unbounded_channel();
        let mailbox = Mailbox {
            node: self.name.clone(),
            queue,
            download_dir: self.download_dir.clone(),
            sink: Arc::clone(&sink),
        };
        let drain = tokio::spawn(async move {
            while let Some(inbound) = inbox.recv().await {
                match inbound {
                    Inbound::Message(message) => sink.message_received(message),
                    Inbound::Data(header, path) => sink.data_received(header, path),
                }
            }
        });
        self.network
            .mailboxes
            .insert(addresses.message_address.clone(), mailbox.clone());
        self.network
            .mailboxes
            .insert(addresses.data_address.clone(), mailbox);
        debug!(node = %self.name, template = %self.template, "Memory channel open");

        *registered = Some(Registered {
            addresses: addresses.clone(),
            drain,
        });
        Ok(addresses)
    }

    async fn close(&self) -> WireResult<()> {
        let registered = self.registered.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(registered) = registered {
            self.network
                .mailboxes
                .remove(&registered.addresses.message_address);
            self.network
                .mailboxes
                .remove(&registered.addresses.data_address);
            registered.drain.abort();
        }
        Ok(())
    }

    async fn send(
        &self,
        to: &EndpointInformation,
        message: &WireMessage,
        max_retries: u32,
    ) -> WireResult<()> {
        let address = Self::target(&to.protocol.message_address, to)?;
        let bytes = serde_json::to_vec(message)?;
        let bytes = bytes.as_slice();
        deliver(&to.id, max_retries, || async move {
            let mailbox = self.network.route(&self.name, address)?;
            let copy: WireMessage = serde_json::from_slice(bytes)?;
            mailbox
                .queue
                .send(Inbound::Message(copy))
                .map_err(|_| WireError::ConnectionClosed)
        })
        .await
    }

    async fn transfer_data(
        &self,
        to: &EndpointInformation,
        header: DataHeader,
        path: &Path,
        cancel: CancelSignal,
        max_retries: u32,
    ) -> WireResult<()> {
        let address = Self::target(&to.protocol.data_address, to)?;
        deliver(&to.id, max_retries, || {
            let (header, cancel) = (header.clone(), cancel.clone());
            async move {
                let mailbox = self.network.route(&self.name, address)?;
                if !mailbox.sink.accepts_data(&header) {
                    return Err(WireError::DataRefused(header.sender));
                }
                tokio::fs::create_dir_all(&mailbox.download_dir).await?;
                let target = download_path(&mailbox.download_dir, &header);
                tokio::select! {
                    copied = tokio::fs::copy(path, &target) => { copied?; }
                    _ = cancelled(cancel) => {
                        let _ = tokio::fs::remove_file(&target).await;
                        return Err(WireError::TransferCancelled);
                    }
                }
                mailbox
                    .queue
                    .send(Inbound::Data(header, target))
                    .map_err(|_| WireError::ConnectionClosed)
            }
        })
        .await
    }

    fn endpoint_disconnected(&self, _id: &EndpointId) {}
}
