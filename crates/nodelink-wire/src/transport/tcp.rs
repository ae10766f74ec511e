//! TCP channel.
//!
//! Messages and data use separate listeners. Outbound message connections are
//! cached per endpoint; every data transfer opens its own connection.

use super::framing::{receive_data, serve_messages, write_data, OutboundConnections};
use super::{deliver, host_port};
use crate::channel::{CancelSignal, Channel, ChannelAddresses, DataHeader, InboundSink};
use crate::error::{WireError, WireResult};
use crate::message::WireMessage;
use async_trait::async_trait;
use nodelink_types::config::TcpConfig;
use nodelink_types::{ChannelTemplate, EndpointId, EndpointInformation};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};
use url::Url;

struct Listening {
    addresses: ChannelAddresses,
    tasks: Vec<JoinHandle<()>>,
}

/// Network channel ([`ChannelTemplate::Tcp`]).
pub struct TcpChannel {
    message_bind: String,
    data_bind: String,
    advertise_host: Option<String>,
    download_dir: PathBuf,
    listening: Mutex<Option<Listening>>,
    connections: OutboundConnections<TcpStream>,
}

impl TcpChannel {
    /// A channel listening on the given `host:port` pairs once opened.
    pub fn new(
        message_bind: impl Into<String>,
        data_bind: impl Into<String>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            message_bind: message_bind.into(),
            data_bind: data_bind.into(),
            advertise_host: None,
            download_dir: download_dir.into(),
            listening: Mutex::new(None),
            connections: OutboundConnections::new(),
        }
    }

    pub fn from_config(config: &TcpConfig, download_dir: impl Into<PathBuf>) -> Self {
        let channel = Self::new(&config.listen_addr, &config.data_listen_addr, download_dir);
        match &config.advertise_host {
            Some(host) => channel.with_advertise_host(host),
            None => channel,
        }
    }

    /// Host announced to peers instead of a wildcard listen address.
    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = Some(host.into());
        self
    }

    fn advertised(&self, local: SocketAddr) -> WireResult<Url> {
        let host = match &self.advertise_host {
            Some(host) => host.clone(),
            None if local.ip().is_unspecified() => "127.0.0.1".to_string(),
            None if local.is_ipv6() => format!("[{}]", local.ip()),
            None => local.ip().to_string(),
        };
        let raw = format!("tcp://{}:{}", host, local.port());
        Url::parse(&raw).map_err(|e| WireError::InvalidAddress(format!("{raw}: {e}")))
    }

    async fn accept_messages(listener: TcpListener, sink: Arc<dyn InboundSink>) {
        let mut streams = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "Accepted message connection");
                        streams.spawn(serve_messages(stream, Arc::clone(&sink)));
                    }
                    Err(e) => {
                        error!(error = %e, "TCP accept error");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
                Some(_) = streams.join_next(), if !streams.is_empty() => {}
            }
        }
    }

    async fn accept_data(listener: TcpListener, dir: PathBuf, sink: Arc<dyn InboundSink>) {
        let mut transfers = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "Accepted data connection");
                        transfers.spawn(receive_data(stream, dir.clone(), Arc::clone(&sink)));
                    }
                    Err(e) => {
                        error!(error = %e, "TCP accept error");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
                Some(_) = transfers.join_next(), if !transfers.is_empty() => {}
            }
        }
    }
}

async fn connect(host: &str, port: u16) -> WireResult<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn required<'a>(address: &'a Option<Url>, to: &EndpointInformation) -> WireResult<&'a Url> {
    address
        .as_ref()
        .ok_or_else(|| WireError::EndpointNotContactable(to.id.clone()))
}

#[async_trait]
impl Channel for TcpChannel {
    fn template(&self) -> ChannelTemplate {
        ChannelTemplate::Tcp
    }

    async fn open(&self, sink: Arc<dyn InboundSink>) -> WireResult<ChannelAddresses> {
        let existing = self
            .listening
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|l| l.addresses.clone());
        if let Some(addresses) = existing {
            return Ok(addresses);
        }

        let messages = TcpListener::bind(&self.message_bind).await?;
        let data = TcpListener::bind(&self.data_bind).await?;
        let addresses = ChannelAddresses {
            message_address: self.advertised(messages.local_addr()?)?,
            data_address: self.advertised(data.local_addr()?)?,
        };
        info!(
            messages = %addresses.message_address,
            data = %addresses.data_address,
            "TCP channel listening"
        );

        let tasks = vec![
            tokio::spawn(Self::accept_messages(messages, Arc::clone(&sink))),
            tokio::spawn(Self::accept_data(data, self.download_dir.clone(), sink)),
        ];

        let mut listening = self.listening.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = listening.as_ref() {
            // Lost a race with a concurrent open.
            for task in tasks {
                task.abort();
            }
            return Ok(existing.addresses.clone());
        }
        *listening = Some(Listening {
            addresses: addresses.clone(),
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
            info!("TCP channel closed");
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
        let (host, port) = host_port(required(&to.protocol.message_address, to)?)?;
        deliver(&to.id, max_retries, || {
            self.connections
                .send(&to.id, message, || connect(&host, port))
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
        let (host, port) = host_port(required(&to.protocol.data_address, to)?)?;
        deliver(&to.id, max_retries, || {
            let (host, header, cancel) = (host.clone(), header.clone(), cancel.clone());
            async move {
                let mut stream = connect(&host, port).await?;
                write_data(&mut stream, &header, path, cancel).await
            }
        })
        .await
    }

    fn endpoint_disconnected(&self, id: &EndpointId) {
        self.connections.remove(id);
    }
}
