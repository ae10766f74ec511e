//! Channel multiplexer: routes outbound traffic to the channel matching the
//! target endpoint's transport and feeds inbound traffic to the correlator.

use crate::approval::{EndpointApprovalStore, EndpointListener};
use crate::channel::{
    cancelled, file_name_of, never_cancelled, CancelSignal, Channel, DataHeader, InboundSink,
};
use crate::correlator::{Dispatch, MessageCorrelator};
use crate::error::{WireError, WireResult};
use crate::event::ProtocolEvent;
use crate::liveness::{ConnectionLivenessMonitor, ConnectionVerifier};
use crate::message::{WireMessage, WireMessageKind};
use crate::upload::UploadRegistry;
use async_trait::async_trait;
use dashmap::DashMap;
use nodelink_types::config::ProtocolConfig;
use nodelink_types::{
    ChannelTemplate, EndpointId, EndpointInformation, MessageId, ProtocolDescription,
    ProtocolInformation, UploadToken, Version,
};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Map a generic answer to a result: `Success` is `Ok`, `Failure` is a
/// remote failure, anything else is unexpected.
pub fn expect_success(response: WireMessage) -> WireResult<()> {
    match response.kind {
        WireMessageKind::Success => Ok(()),
        WireMessageKind::Failure { reason } => Err(WireError::RemoteFailure(reason)),
        _ => Err(WireError::UnexpectedResponse(response.kind_name().to_string())),
    }
}

/// Owns the channels of the local endpoint.
pub struct ChannelMultiplexer {
    local: EndpointId,
    version: Version,
    config: ProtocolConfig,
    store: Arc<EndpointApprovalStore>,
    correlator: Arc<MessageCorrelator>,
    liveness: Arc<ConnectionLivenessMonitor>,
    uploads: Arc<UploadRegistry>,
    channels: HashMap<ChannelTemplate, Arc<dyn Channel>>,
    open: RwLock<HashMap<ChannelTemplate, ProtocolInformation>>,
    downloads: DashMap<MessageId, (EndpointId, oneshot::Sender<PathBuf>)>,
    events: broadcast::Sender<ProtocolEvent>,
}

impl ChannelMultiplexer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: EndpointId,
        version: Version,
        config: ProtocolConfig,
        store: Arc<EndpointApprovalStore>,
        correlator: Arc<MessageCorrelator>,
        liveness: Arc<ConnectionLivenessMonitor>,
        uploads: Arc<UploadRegistry>,
        channels: Vec<Arc<dyn Channel>>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let channels = channels
            .into_iter()
            .map(|channel| (channel.template(), channel))
            .collect();
        Self {
            local,
            version,
            config,
            store,
            correlator,
            liveness,
            uploads,
            channels,
            open: RwLock::new(HashMap::new()),
            downloads: DashMap::new(),
            events,
        }
    }

    pub fn local_id(&self) -> &EndpointId {
        &self.local
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn liveness(&self) -> &Arc<ConnectionLivenessMonitor> {
        &self.liveness
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }

    /// Open every channel. Already open channels keep their addresses.
    pub async fn open_channels(self: &Arc<Self>) -> WireResult<Vec<ChannelTemplate>> {
        let mut opened = Vec::new();
        for (template, channel) in &self.channels {
            let sink: Arc<dyn InboundSink> = Arc::new(MuxSink(Arc::downgrade(self)));
            let addresses = channel.open(sink).await?;
            let info = ProtocolInformation::new(
                self.version,
                addresses.message_address,
                addresses.data_address,
            );
            info!(template = %template, address = ?info.message_address, "Channel open");
            self.open
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(*template, info);
            opened.push(*template);
        }
        Ok(opened)
    }

    /// Close every channel and cancel everything still waiting on it.
    pub async fn close_channels(&self) {
        let templates: Vec<ChannelTemplate> = {
            let mut open = self.open.write().unwrap_or_else(|e| e.into_inner());
            open.drain().map(|(template, _)| template).collect()
        };
        for template in templates {
            if let Some(channel) = self.channels.get(&template) {
                if let Err(e) = channel.close().await {
                    warn!(template = %template, error = %e, "Failed to close channel");
                }
            }
        }
        self.correlator.on_local_channel_closed();
        self.downloads.clear();
    }

    /// Reachability of the local endpoint over `template`, once open.
    pub fn local_info(&self, template: ChannelTemplate) -> Option<ProtocolInformation> {
        let open = self.open.read().unwrap_or_else(|e| e.into_inner());
        open.get(&template).cloned()
    }

    pub fn is_open(&self, template: ChannelTemplate) -> bool {
        let open = self.open.read().unwrap_or_else(|e| e.into_inner());
        open.contains_key(&template)
    }

    fn connection_for(&self, endpoint: &EndpointId) -> WireResult<EndpointInformation> {
        self.store
            .try_get_connection_for(endpoint)
            .ok_or_else(|| WireError::EndpointNotContactable(endpoint.clone()))
    }

    fn channel_for(&self, info: &EndpointInformation) -> WireResult<Arc<dyn Channel>> {
        let template = info.template().ok_or_else(|| {
            WireError::InvalidAddress(format!("{}: no usable message address", info.id))
        })?;
        if !self.is_open(template) {
            return Err(WireError::ChannelNotOpen(template));
        }
        self.channels
            .get(&template)
            .cloned()
            .ok_or(WireError::ChannelNotOpen(template))
    }

    /// Deliver `message` to `endpoint`.
    pub async fn send_to(
        &self,
        endpoint: &EndpointId,
        message: &WireMessage,
        max_retries: u32,
    ) -> WireResult<()> {
        let info = self.connection_for(endpoint)?;
        let channel = self.channel_for(&info)?;
        channel.send(&info, message, max_retries).await?;
        self.liveness.confirm(endpoint);
        Ok(())
    }

    /// Send `message` and wait up to `timeout` for the message answering it.
    ///
    /// The wait is registered before sending so a fast answer cannot be
    /// missed. A responder that disconnects, or a local channel that closes,
    /// ends the wait with [`WireError::ResponseCancelled`].
    pub async fn send_and_wait_for_response(
        &self,
        endpoint: &EndpointId,
        message: WireMessage,
        timeout: Duration,
    ) -> WireResult<WireMessage> {
        self.connection_for(endpoint)?;
        let wait = self.correlator.forward_response(endpoint, message.id);

        if let Err(e) = self
            .send_to(endpoint, &message, self.config.max_send_retries)
            .await
        {
            self.correlator.forget(message.id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(response)) => {
                self.liveness.confirm(endpoint);
                Ok(response)
            }
            Ok(Err(_)) => Err(WireError::ResponseCancelled),
            Err(_) => {
                self.correlator.forget(message.id);
                Err(WireError::ResponseTimedOut(timeout))
            }
        }
    }

    /// Stream the file at `path` to `endpoint`.
    pub async fn upload_data(
        &self,
        endpoint: &EndpointId,
        path: &Path,
        cancel: CancelSignal,
    ) -> WireResult<()> {
        self.transfer(endpoint, path, MessageId::NONE, cancel).await
    }

    /// Stream the file registered under `token` in answer to `request`.
    pub async fn transfer_upload(
        &self,
        endpoint: &EndpointId,
        token: UploadToken,
        request: MessageId,
    ) -> WireResult<()> {
        let path = self
            .uploads
            .path_for(token)
            .ok_or(WireError::UnknownUploadToken(token))?;
        self.transfer(endpoint, &path, request, never_cancelled())
            .await
    }

    async fn transfer(
        &self,
        endpoint: &EndpointId,
        path: &Path,
        in_response_to: MessageId,
        cancel: CancelSignal,
    ) -> WireResult<()> {
        let info = self.connection_for(endpoint)?;
        let channel = self.channel_for(&info)?;
        let length = tokio::fs::metadata(path).await?.len();
        let header = DataHeader {
            sender: self.local.clone(),
            id: MessageId::new(),
            in_response_to,
            file_name: file_name_of(path),
            length,
        };
        debug!(endpoint = %endpoint, file = %header.file_name, length, "Starting data transfer");
        channel
            .transfer_data(&info, header, path, cancel, self.config.max_send_retries)
            .await?;
        self.liveness.confirm(endpoint);
        Ok(())
    }

    /// Ask `endpoint` for the file it registered under `token` and wait for it
    /// to arrive.
    pub async fn download_data(
        &self,
        endpoint: &EndpointId,
        token: UploadToken,
        cancel: CancelSignal,
    ) -> WireResult<PathBuf> {
        let request = WireMessage::new(
            self.local.clone(),
            WireMessageKind::DataDownloadRequest { token },
        );
        let request_id = request.id;
        let (arrived, arrival) = oneshot::channel();
        self.downloads
            .insert(request_id, (endpoint.clone(), arrived));

        let timeout = self.config.response_timeout();
        let result = async {
            let response = self
                .send_and_wait_for_response(endpoint, request, timeout)
                .await?;
            expect_success(response)?;
            tokio::select! {
                path = arrival => path.map_err(|_| WireError::ResponseCancelled),
                _ = cancelled(cancel) => Err(WireError::TransferCancelled),
                _ = tokio::time::sleep(timeout) => Err(WireError::ResponseTimedOut(timeout)),
            }
        }
        .await;

        self.downloads.remove(&request_id);
        result
    }

    /// Tell every known endpoint that we are leaving. Failures are ignored.
    pub async fn notify_disconnecting(&self) {
        let message = WireMessage::new(self.local.clone(), WireMessageKind::EndpointDisconnecting);
        let targets = self.store.approved_endpoints();
        let sends = targets.iter().map(|id| {
            let message = &message;
            async move {
                if let Err(e) = self.send_to(id, message, 0).await {
                    debug!(endpoint = %id, error = %e, "Disconnect notification not delivered");
                }
            }
        });
        futures::future::join_all(sends).await;
    }

    fn message_received(&self, message: WireMessage) {
        let sender = message.sender.clone();
        if self.correlator.process_message(message) != Dispatch::Rejected {
            self.liveness.confirm(&sender);
        }
    }

    fn accepts_data(&self, header: &DataHeader) -> bool {
        if !self.store.can_communicate_with(&header.sender) {
            warn!(sender = %header.sender, "Refusing data from unapproved endpoint");
            return false;
        }
        let max = self.config.max_inbound_data_bytes;
        if header.length > max {
            warn!(sender = %header.sender, length = header.length, max, "Refusing oversized data");
            return false;
        }
        true
    }

    fn data_received(&self, header: DataHeader, path: PathBuf) {
        if !self.store.can_communicate_with(&header.sender) {
            warn!(sender = %header.sender, "Discarding data from unapproved endpoint");
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "Failed to discard data");
            }
            return;
        }
        self.liveness.confirm(&header.sender);

        if !header.in_response_to.is_none() {
            if let Some((_, (_, waiter))) = self.downloads.remove(&header.in_response_to) {
                // The downloader may have given up already.
                let _ = waiter.send(path);
                return;
            }
        }

        info!(sender = %header.sender, file = %header.file_name, "Data received");
        let _ = self.events.send(ProtocolEvent::DataReceived {
            from: header.sender,
            path,
            file_name: header.file_name,
        });
    }
}

#[async_trait]
impl ConnectionVerifier for ChannelMultiplexer {
    async fn verify(
        &self,
        endpoint: &EndpointId,
        payload: Option<Value>,
        timeout: Duration,
    ) -> WireResult<Option<Value>> {
        let probe = WireMessage::new(
            self.local.clone(),
            WireMessageKind::ConnectionVerification { payload },
        );
        let response = self
            .send_and_wait_for_response(endpoint, probe, timeout)
            .await?;
        match response.kind {
            WireMessageKind::ConnectionVerificationResponse { payload } => Ok(payload),
            WireMessageKind::Failure { reason } => Err(WireError::RemoteFailure(reason)),
            _ => Err(WireError::UnexpectedResponse(
                response.kind_name().to_string(),
            )),
        }
    }
}

impl EndpointListener for ChannelMultiplexer {
    fn endpoint_connected(&self, info: &EndpointInformation, description: &ProtocolDescription) {
        let _ = self.events.send(ProtocolEvent::EndpointConnected {
            info: info.clone(),
            description: description.clone(),
        });
    }

    fn endpoint_disconnected(&self, id: &EndpointId) {
        for channel in self.channels.values() {
            channel.endpoint_disconnected(id);
        }
        self.downloads.retain(|_, (from, _)| from != id);
        let _ = self
            .events
            .send(ProtocolEvent::EndpointDisconnected { id: id.clone() });
    }
}

/// Inbound sink handed to channels. Holds the multiplexer weakly so channels
/// never keep it alive.
struct MuxSink(Weak<ChannelMultiplexer>);

impl InboundSink for MuxSink {
    fn message_received(&self, message: WireMessage) {
        if let Some(mux) = self.0.upgrade() {
            mux.message_received(message);
        }
    }

    fn accepts_data(&self, header: &DataHeader) -> bool {
        self.0
            .upgrade()
            .is_some_and(|mux| mux.accepts_data(header))
    }

    fn data_received(&self, header: DataHeader, path: PathBuf) {
        if let Some(mux) = self.0.upgrade() {
            mux.data_received(header, path);
        }
    }
}
