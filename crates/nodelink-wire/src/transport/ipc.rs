//! Same-machine channel over Unix domain sockets.
//!
//! Addresses look like `ipc:///tmp/nodelink/ipc/<uuid>-messages.sock`. The
//! socket files are created on open and removed on close.

use super::deliver;
use super::framing::{receive_data, serve_messages, write_data, OutboundConnections};
use crate::channel::{CancelSignal, Channel, ChannelAddresses, DataHeader, InboundSink};
use crate::error::{WireError, WireResult};
use crate::message::WireMessage;
use async_trait::async_trait;
use nodelink_types::{ChannelTemplate, EndpointId, EndpointInformation};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use url::Url;

struct Listening {
    addresses: ChannelAddresses,
    sockets: [PathBuf; 2],
    tasks: Vec<JoinHandle<()>>,
}

/// Local inter-process channel ([`ChannelTemplate::LocalIpc`]).
pub struct IpcChannel {
    socket_dir: PathBuf,
    download_dir: PathBuf,
    listening: Mutex<Option<Listening>>,
    connections: OutboundConnections<UnixStream>,
}

impl IpcChannel {
    pub fn new(socket_dir: impl Into<PathBuf>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            download_dir: download_dir.into(),
            listening: Mutex::new(None),
            connections: OutboundConnections::new(),
        }
    }

    fn bind(path: &Path) -> WireResult<UnixListener> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(UnixListener::bind(path)?)
    }

    async fn accept_messages(listener: UnixListener, sink: Arc<dyn InboundSink>) {
        let mut streams = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        debug!("Accepted IPC message connection");
                        streams.spawn(serve_messages(stream, Arc::clone(&sink)));
                    }
                    Err(e) => {
                        error!(error = %e, "IPC accept error");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
                Some(_) = streams.join_next(), if !streams.is_empty() => {}
            }
        }
    }

    async fn accept_data(listener: UnixListener, dir: PathBuf, sink: Arc<dyn InboundSink>) {
        let mut transfers = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        transfers.spawn(receive_data(stream, dir.clone(), Arc::clone(&sink)));
                    }
                    Err(e) => {
                        error!(error = %e, "IPC accept error");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
                Some(_) = transfers.join_next(), if !transfers.is_empty() => {}
            }
        }
    }
}

/// `ipc://` URL for a socket path.
pub fn socket_url(path: &Path) -> WireResult<Url> {
    let file = Url::from_file_path(path)
        .map_err(|_| WireError::InvalidAddress(format!("{} is not absolute", path.display())))?;
    let raw = format!("ipc://{}", file.path());
    Url::parse(&raw).map_err(|e| WireError::InvalidAddress(format!("{raw}: {e}")))
}

/// Socket path named by an `ipc://` URL.
pub fn socket_path(address: &Url) -> WireResult<PathBuf> {
    if address.scheme() != ChannelTemplate::LocalIpc.scheme()
        || address.host_str().is_some_and(|h| !h.is_empty())
    {
        return Err(WireError::InvalidAddress(format!(
            "{address} is not a socket address"
        )));
    }
    Url::parse(&format!("file://{}", address.path()))
        .ok()
        .and_then(|file| file.to_file_path().ok())
        .ok_or_else(|| WireError::InvalidAddress(address.to_string()))
}

fn required(address: &Option<Url>, to: &EndpointInformation) -> WireResult<PathBuf> {
    match address {
        Some(address) => socket_path(address),
        None => Err(WireError::EndpointNotContactable(to.id.clone())),
    }
}

#[async_trait]
impl Channel for IpcChannel {
    fn template(&self) -> ChannelTemplate {
        ChannelTemplate::LocalIpc
    }

    async fn open(&self, sink: Arc<dyn InboundSink>) -> WireResult<ChannelAddresses> {
        let mut listening = self.listening.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(listening) = listening.as_ref() {
            return Ok(listening.addresses.clone());
        }

        std::fs::create_dir_all(&self.socket_dir)?;
        let prefix = uuid::Uuid::new_v4();
        let message_socket = self.socket_dir.join(format!("{prefix}-messages.sock"));
        let data_socket = self.socket_dir.join(format!("{prefix}-data.sock"));

        // UnixListener::bind is synchronous, so the lock is never held across an await.
        let messages = Self::bind(&message_socket)?;
        let data = Self::bind(&data_socket)?;
        let addresses = ChannelAddresses {
            message_address: socket_url(&message_socket)?,
            data_address: socket_url(&data_socket)?,
        };
        info!(
            messages = %addresses.message_address,
            data = %addresses.data_address,
            "IPC channel listening"
        );

        let tasks = vec![
            tokio::spawn(Self::accept_messages(messages, Arc::clone(&sink))),
            tokio::spawn(Self::accept_data(data, self.download_dir.clone(), sink)),
        ];
        *listening = Some(Listening {
            addresses: addresses.clone(),
            sockets: [message_socket, data_socket],
            tasks,
        });
        Ok(addresses)
    }

    async fn close(&self) -> WireResult<()> {
        let listening = self.listening.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(listening) = listening {
            for task in listening.tasks {
                task.abort();
            }
            for socket in &listening.sockets {
                if let Err(e) = std::fs::remove_file(socket) {
                    warn!(path = %socket.display(), error = %e, "Failed to remove IPC socket");
                }
            }
            info!("IPC channel closed");
        }
        self.connections.clear();
        Ok(())
    }

    async fn send(
        &self,
        to: &EndpointInformation,
        message: &WireMessage,
        max_retries: u32,
    ) -> WireResult<()> {
        let socket = required(&to.protocol.message_address, to)?;
        let socket = socket.as_path();
        deliver(&to.id, max_retries, || {
            self.connections.send(&to.id, message, || async move {
                Ok(UnixStream::connect(socket).await?)
            })
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
        let socket = required(&to.protocol.data_address, to)?;
        deliver(&to.id, max_retries, || {
            let (socket, header, cancel) = (socket.clone(), header.clone(), cancel.clone());
            async move {
                let mut stream = UnixStream::connect(&socket).await?;
                write_data(&mut stream, &header, path, cancel).await
            }
        })
        .await
    }

    fn endpoint_disconnected(&self, id: &EndpointId) {
        self.connections.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::WireMessageKind;
    use nodelink_types::{ProtocolInformation, Version};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ForwardingSink(mpsc::UnboundedSender<WireMessage>);

    impl InboundSink for ForwardingSink {
        fn message_received(&self, message: WireMessage) {
            let _ = self.0.send(message);
        }

        fn data_received(&self, _header: DataHeader, _path: PathBuf) {}
    }

    #[test]
    fn test_socket_url_round_trip() {
        let path = Path::new("/tmp/nodelink/ipc/a b-messages.sock");
        let url = socket_url(path).unwrap();
        assert_eq!(url.scheme(), "ipc");
        assert_eq!(socket_path(&url).unwrap(), path);
    }

    #[test]
    fn test_socket_path_rejects_foreign_addresses() {
        let tcp = Url::parse("tcp://127.0.0.1:4500").unwrap();
        assert!(socket_path(&tcp).is_err());
        let named = Url::parse("ipc://node-a/messages").unwrap();
        assert!(socket_path(&named).is_err());
    }

    #[tokio::test]
    async fn test_message_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = IpcChannel::new(dir.path().join("sock"), dir.path().join("in"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let addresses = receiver.open(Arc::new(ForwardingSink(tx))).await.unwrap();

        let sender = IpcChannel::new(dir.path().join("sock"), dir.path().join("out"));
        let target = EndpointInformation::new(
            EndpointId::new("alpha"),
            ProtocolInformation::new(
                Version::new(1, 0, 0),
                addresses.message_address.clone(),
                addresses.data_address.clone(),
            ),
        );
        let msg = WireMessage::new(EndpointId::new("alpha"), WireMessageKind::Success);
        sender.send(&target, &msg, 0).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.id, msg.id);

        receiver.close().await.unwrap();
        assert!(!socket_path(&addresses.message_address).unwrap().exists());
    }
}
