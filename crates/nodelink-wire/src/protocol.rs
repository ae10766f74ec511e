//! The protocol layer: one object per local endpoint tying the approval
//! store, correlator, liveness monitor, handshake and channels together.

use crate::actions;
use crate::approval::{EndpointApprovalStore, EndpointListener};
use crate::channel::{CancelSignal, Channel};
use crate::commands::{CommandHandler, CommandRegistry};
use crate::correlator::{MessageAction, MessageCorrelator, MessageFilter};
use crate::discovery::{DiscoverySink, DiscoverySource, ManualDiscovery};
use crate::error::{WireError, WireResult};
use crate::event::ProtocolEvent;
use crate::handshake::HandshakeConductor;
use crate::liveness::{ConnectionLivenessMonitor, ConnectionVerifier, KeepAliveHandler};
use crate::message::{WireMessage, WireMessageKind};
use crate::mux::ChannelMultiplexer;
use crate::transport::tcp::TcpChannel;
use crate::upload::UploadRegistry;
use nodelink_types::config::{NodeConfig, ProtocolConfig};
use nodelink_types::{
    ChannelTemplate, EndpointId, MessageId, ProtocolDescription, ProtocolInformation, UploadToken,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Settings of a [`ProtocolLayer`] beyond its channels.
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    pub config: ProtocolConfig,
    pub description: ProtocolDescription,
    /// Secret both sides must share for a `Connect` to be accepted.
    pub shared_secret: Option<String>,
}

/// Entry point for application code.
pub struct ProtocolLayer {
    local: EndpointId,
    config: ProtocolConfig,
    store: Arc<EndpointApprovalStore>,
    correlator: Arc<MessageCorrelator>,
    liveness: Arc<ConnectionLivenessMonitor>,
    mux: Arc<ChannelMultiplexer>,
    conductor: Arc<HandshakeConductor>,
    uploads: Arc<UploadRegistry>,
    commands: Arc<CommandRegistry>,
    discoveries: Mutex<Vec<Arc<dyn DiscoverySource>>>,
    signed_in: tokio::sync::Mutex<bool>,
}

impl ProtocolLayer {
    pub fn new(
        local: EndpointId,
        settings: ProtocolSettings,
        channels: Vec<Arc<dyn Channel>>,
    ) -> Arc<Self> {
        let ProtocolSettings {
            config,
            description,
            shared_secret,
        } = settings;

        let store = Arc::new(EndpointApprovalStore::new());
        let correlator = Arc::new(MessageCorrelator::new(Arc::clone(&store)));
        let liveness = Arc::new(ConnectionLivenessMonitor::new(
            Arc::clone(&store),
            config.clone(),
        ));
        let uploads = Arc::new(UploadRegistry::new());
        let commands = Arc::new(CommandRegistry::new());
        let mux = Arc::new(ChannelMultiplexer::new(
            local.clone(),
            description.version,
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&correlator),
            Arc::clone(&liveness),
            Arc::clone(&uploads),
            channels,
        ));
        let conductor = HandshakeConductor::new(
            Arc::clone(&store),
            Arc::clone(&mux),
            description,
            shared_secret,
        );

        let listeners: [Arc<dyn EndpointListener>; 4] = [
            correlator.clone(),
            liveness.clone(),
            conductor.clone(),
            mux.clone(),
        ];
        for listener in &listeners {
            store.subscribe(Arc::downgrade(listener));
        }
        actions::install(&correlator, &store, &mux, &conductor, &commands);

        Arc::new(Self {
            local,
            config,
            store,
            correlator,
            liveness,
            mux,
            conductor,
            uploads,
            commands,
            discoveries: Mutex::new(Vec::new()),
            signed_in: tokio::sync::Mutex::new(false),
        })
    }

    /// Build a layer with the channels and static peers named in `config`.
    pub fn from_config(config: &NodeConfig) -> WireResult<Arc<Self>> {
        let machine = config.resolved_machine_name();
        let local = match config.node_id {
            Some(id) => EndpointId::with_id(id, machine),
            None => EndpointId::new(machine),
        };
        let download_dir = config.resolved_download_dir();

        let mut channels: Vec<Arc<dyn Channel>> = Vec::new();
        if config.tcp.enabled {
            channels.push(Arc::new(TcpChannel::from_config(
                &config.tcp,
                download_dir.clone(),
            )));
        }
        if config.ipc.enabled {
            #[cfg(unix)]
            channels.push(Arc::new(crate::transport::ipc::IpcChannel::new(
                config.ipc.resolved_socket_dir(),
                download_dir.clone(),
            )));
            #[cfg(not(unix))]
            warn!("Local IPC is only available on unix, continuing without it");
        }
        if channels.is_empty() {
            return Err(WireError::InvalidArgument(
                "no transport enabled; enable tcp or ipc".to_string(),
            ));
        }

        let description = ProtocolDescription::new(
            config.protocol_version,
            config.subjects.iter().map(String::as_str),
        );
        let layer = Self::new(
            local,
            ProtocolSettings {
                config: config.protocol.clone(),
                description,
                shared_secret: config.shared_secret.clone(),
            },
            channels,
        );
        if !config.peers.is_empty() {
            let peers = ManualDiscovery::from_peers(&config.peers, config.protocol_version)?;
            layer.add_discovery(Arc::new(peers));
        }
        Ok(layer)
    }

    pub fn local_id(&self) -> &EndpointId {
        &self.local
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EndpointApprovalStore> {
        &self.store
    }

    /// Description sent to peers during the handshake.
    pub fn local_description(&self) -> ProtocolDescription {
        self.conductor.description()
    }

    /// Where peers reach us over `template`, once signed in.
    pub fn local_protocol_info(&self, template: ChannelTemplate) -> Option<ProtocolInformation> {
        self.mux.local_info(template)
    }

    /// Attach a discovery source. Sources added while signed in start on the
    /// next sign-in.
    pub fn add_discovery(&self, source: Arc<dyn DiscoverySource>) {
        self.discoveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(source);
    }

    fn discovery_sources(&self) -> Vec<Arc<dyn DiscoverySource>> {
        self.discoveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// A sink for discovery sources driven by the caller.
    pub fn discovery_sink(&self) -> Arc<dyn DiscoverySink> {
        self.conductor.clone()
    }

    pub async fn is_signed_in(&self) -> bool {
        *self.signed_in.lock().await
    }

    /// Open channels, start the keep-alive timer and start discovery.
    /// Signing in twice is a no-op.
    pub async fn sign_in(&self) -> WireResult<()> {
        let mut signed_in = self.signed_in.lock().await;
        if *signed_in {
            return Ok(());
        }

        let templates = match self.mux.open_channels().await {
            Ok(templates) => templates,
            Err(e) => {
                // Channels opened before the failure must not keep listening.
                self.mux.close_channels().await;
                return Err(e);
            }
        };
        let mux: Arc<dyn ConnectionVerifier> = self.mux.clone();
        let verifier: Weak<dyn ConnectionVerifier> = Arc::downgrade(&mux);
        self.liveness.start(verifier);

        let sink = self.discovery_sink();
        for source in self.discovery_sources() {
            if let Err(e) = source.start_discovery(Arc::clone(&sink)).await {
                warn!(error = %e, "Failed to start discovery source");
            }
        }

        *signed_in = true;
        info!(endpoint = %self.local, channels = templates.len(), "Signed in");
        Ok(())
    }

    /// Tell peers we are leaving, stop everything and forget all endpoints.
    /// Every pending wait ends with [`WireError::ResponseCancelled`].
    pub async fn sign_out(&self) -> WireResult<()> {
        let mut signed_in = self.signed_in.lock().await;
        if !*signed_in {
            return Ok(());
        }

        for source in self.discovery_sources() {
            if let Err(e) = source.end_discovery().await {
                warn!(error = %e, "Failed to stop discovery source");
            }
        }
        self.mux.notify_disconnecting().await;
        self.liveness.stop();
        self.mux.close_channels().await;
        self.store.clear();

        *signed_in = false;
        info!(endpoint = %self.local, "Signed out");
        Ok(())
    }

    /// A message from the local endpoint.
    pub fn message(&self, kind: WireMessageKind) -> WireMessage {
        WireMessage::new(self.local.clone(), kind)
    }

    /// Send `kind` to an approved endpoint without waiting for an answer.
    pub async fn send_to(&self, endpoint: &EndpointId, kind: WireMessageKind) -> WireResult<MessageId> {
        let message = self.message(kind);
        self.mux
            .send_to(endpoint, &message, self.config.max_send_retries)
            .await?;
        Ok(message.id)
    }

    /// Send `kind` and wait for the answer, up to `timeout` or the configured
    /// default.
    pub async fn send_and_wait_for_response(
        &self,
        endpoint: &EndpointId,
        kind: WireMessageKind,
        timeout: Option<Duration>,
    ) -> WireResult<WireMessage> {
        let timeout = timeout.unwrap_or_else(|| self.config.response_timeout());
        self.mux
            .send_and_wait_for_response(endpoint, self.message(kind), timeout)
            .await
    }

    /// Answer a received message.
    pub async fn respond(&self, request: &WireMessage, kind: WireMessageKind) -> WireResult<()> {
        let answer = WireMessage::response(self.local.clone(), request.id, kind);
        self.mux
            .send_to(&request.sender, &answer, self.config.max_send_retries)
            .await
    }

    /// Handle inbound messages accepted by `filter`. Filters are tried in
    /// registration order after the built-in ones.
    pub fn act_on_arrival(&self, filter: MessageFilter, action: Arc<dyn MessageAction>) {
        self.correlator.act_on_arrival(filter, action);
    }

    /// Stream a file to an approved endpoint.
    pub async fn upload_data(
        &self,
        endpoint: &EndpointId,
        path: &Path,
        cancel: CancelSignal,
    ) -> WireResult<()> {
        self.mux.upload_data(endpoint, path, cancel).await
    }

    /// Fetch the file `endpoint` registered under `token`.
    pub async fn download_data(
        &self,
        endpoint: &EndpointId,
        token: UploadToken,
        cancel: CancelSignal,
    ) -> WireResult<PathBuf> {
        self.mux.download_data(endpoint, token, cancel).await
    }

    /// Offer a file for download by peers.
    pub fn register_upload(&self, path: impl Into<PathBuf>) -> WireResult<UploadToken> {
        self.uploads.register(path)
    }

    pub fn deregister_upload(&self, token: UploadToken) -> Option<PathBuf> {
        self.uploads.deregister(token)
    }

    /// Register a command and advertise it in future handshakes.
    pub fn register_command(&self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.commands.register(name, handler);
        self.advertise_commands();
    }

    pub fn unregister_command(&self, name: &str) -> bool {
        let removed = self.commands.unregister(name);
        if removed {
            self.advertise_commands();
        }
        removed
    }

    fn advertise_commands(&self) {
        let mut description = self.conductor.description();
        description.commands = self.commands.names();
        self.conductor.set_description(description);
    }

    /// Run `command` on `endpoint` and return its result.
    pub async fn invoke_command(
        &self,
        endpoint: &EndpointId,
        command: &str,
        arguments: Value,
    ) -> WireResult<Value> {
        let response = self
            .send_and_wait_for_response(
                endpoint,
                WireMessageKind::CommandInvoked {
                    command: command.to_string(),
                    arguments,
                },
                None,
            )
            .await?;
        match response.kind {
            WireMessageKind::CommandResponse { result } => Ok(result),
            WireMessageKind::Failure { reason } => Err(WireError::RemoteFailure(reason)),
            _ => Err(WireError::UnexpectedResponse(
                response.kind_name().to_string(),
            )),
        }
    }

    /// Install the keep-alive handler. Only one may be installed at a time.
    pub fn register_keep_alive_handler(&self, handler: Arc<KeepAliveHandler>) -> bool {
        self.liveness.register_handler(handler)
    }

    pub fn unregister_keep_alive_handler(&self, handler: &Arc<KeepAliveHandler>) -> bool {
        self.liveness.unregister_handler(handler)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.mux.subscribe()
    }

    pub fn approved_endpoints(&self) -> Vec<EndpointId> {
        self.store.approved_endpoints()
    }

    pub fn can_communicate_with(&self, endpoint: &EndpointId) -> bool {
        self.store.can_communicate_with(endpoint)
    }

    /// Description an approved endpoint sent during the handshake.
    pub fn description_of(&self, endpoint: &EndpointId) -> Option<ProtocolDescription> {
        self.store.description_for(endpoint)
    }
}
