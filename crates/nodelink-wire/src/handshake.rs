//! Symmetric connect handshake.
//!
//! Each side sends a `Connect` and answers the other's. An endpoint is
//! approved once all four steps are recorded for it: connect sent, connect
//! received, response sent, response received. Whichever step completes the
//! set approves the endpoint, so it is approved exactly once no matter who
//! started.

use crate::approval::{EndpointApprovalStore, EndpointListener};
use crate::auth::ConnectAuth;
use crate::discovery::DiscoverySink;
use crate::message::{WireMessage, WireMessageKind};
use crate::mux::ChannelMultiplexer;
use nodelink_types::{
    ChannelTemplate, EndpointId, EndpointInformation, MessageId, ProtocolDescription,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, info, warn};

/// Whether an endpoint with `remote` may connect to one with `local`.
pub fn allow_connection(local: &ProtocolDescription, remote: &ProtocolDescription) -> bool {
    local.is_compatible_with(remote)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    SentConnect,
    ReceivedConnect,
    SentConnectResponse,
    ReceivedConnectResponse,
}

#[derive(Debug, Default, Clone, Copy)]
struct HandshakeTicks {
    sent_connect: bool,
    received_connect: bool,
    sent_connect_response: bool,
    received_connect_response: bool,
}

impl HandshakeTicks {
    fn slot(&mut self, step: Step) -> &mut bool {
        match step {
            Step::SentConnect => &mut self.sent_connect,
            Step::ReceivedConnect => &mut self.received_connect,
            Step::SentConnectResponse => &mut self.sent_connect_response,
            Step::ReceivedConnectResponse => &mut self.received_connect_response,
        }
    }

    fn is_complete(&self) -> bool {
        self.sent_connect
            && self.received_connect
            && self.sent_connect_response
            && self.received_connect_response
    }
}

/// Result of recording one step.
#[derive(Debug, Clone, Copy)]
struct Marked {
    /// The step was not recorded before.
    newly: bool,
    /// This call completed the handshake.
    completed: bool,
}

/// Drives the handshake with every discovered or connecting endpoint.
pub struct HandshakeConductor {
    me: Weak<HandshakeConductor>,
    local: EndpointId,
    store: Arc<EndpointApprovalStore>,
    mux: Arc<ChannelMultiplexer>,
    description: RwLock<ProtocolDescription>,
    shared_secret: Option<String>,
    ticks: Mutex<HashMap<EndpointId, HandshakeTicks>>,
    /// The `Connect` each endpoint was last answered for, kept until it disconnects.
    accepted: Mutex<HashMap<EndpointId, MessageId>>,
}

impl HandshakeConductor {
    pub fn new(
        store: Arc<EndpointApprovalStore>,
        mux: Arc<ChannelMultiplexer>,
        description: ProtocolDescription,
        shared_secret: Option<String>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            local: mux.local_id().clone(),
            store,
            mux,
            description: RwLock::new(description),
            shared_secret,
            ticks: Mutex::new(HashMap::new()),
            accepted: Mutex::new(HashMap::new()),
        })
    }

    pub fn description(&self) -> ProtocolDescription {
        self.description
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the description sent in future `Connect` messages.
    pub fn set_description(&self, description: ProtocolDescription) {
        *self.description.write().unwrap_or_else(|e| e.into_inner()) = description;
    }

    /// Endpoints with a handshake in progress.
    pub fn in_progress(&self) -> usize {
        self.ticks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn mark(&self, id: &EndpointId, step: Step) -> Marked {
        let mut ticks = self.ticks.lock().unwrap_or_else(|e| e.into_inner());
        let entry = ticks.entry(id.clone()).or_default();
        let slot = entry.slot(step);
        let newly = !*slot;
        *slot = true;
        Marked {
            newly,
            completed: newly && entry.is_complete(),
        }
    }

    fn forget(&self, id: &EndpointId) {
        self.ticks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    fn forget_accepted(&self, id: &EndpointId) {
        self.accepted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    fn was_accepted(&self, id: &EndpointId, connect_id: MessageId) -> bool {
        self.accepted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            == Some(&connect_id)
    }

    /// Local endpoints talk over local IPC, remote ones over TCP, and only
    /// through channels that are open.
    fn is_reachable(&self, info: &EndpointInformation) -> bool {
        let Some(template) = info.template() else {
            return false;
        };
        let wanted = if info.id.is_on_machine(self.local.machine()) {
            ChannelTemplate::LocalIpc
        } else {
            ChannelTemplate::Tcp
        };
        template == wanted && self.mux.is_open(template)
    }

    /// Start the handshake with a newly known endpoint.
    fn begin(&self, info: EndpointInformation) {
        let id = info.id.clone();
        if self.store.try_add(&id, info.clone()) {
            debug!(endpoint = %id, "Endpoint discovered");
            if let Some(me) = self.me.upgrade() {
                tokio::spawn(async move { me.initiate_handshake(&id).await });
            }
        } else {
            self.refresh(info);
        }
    }

    /// Replace incomplete connection information with a complete one.
    fn refresh(&self, info: EndpointInformation) {
        let stale = self
            .store
            .try_get_connection_for(&info.id)
            .map(|known| !known.is_complete())
            .unwrap_or(false);
        if stale && info.is_complete() && self.store.try_update(info.clone()) {
            debug!(endpoint = %info.id, "Connection information updated");
            if self.handshake_finished(&info.id) {
                self.approve(&info.id);
            }
        }
    }

    fn handshake_finished(&self, id: &EndpointId) -> bool {
        self.ticks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .is_some_and(HandshakeTicks::is_complete)
    }

    /// Send our `Connect` to `id` unless it was already sent, and process
    /// the answer.
    pub async fn initiate_handshake(&self, id: &EndpointId) {
        if self.store.can_communicate_with(id) {
            return;
        }
        let Some(info) = self.store.try_get_connection_for(id) else {
            return;
        };
        let Some(protocol) = info.template().and_then(|t| self.mux.local_info(t)) else {
            warn!(endpoint = %id, "No open channel to reach endpoint");
            self.abort(id);
            return;
        };
        if !self.mark(id, Step::SentConnect).newly {
            return;
        }

        let auth = ConnectAuth::sign(self.shared_secret.as_deref(), &self.local);
        let connect = WireMessage::new(
            self.local.clone(),
            WireMessageKind::Connect {
                protocol,
                description: self.description(),
                nonce: auth.nonce,
                auth_hmac: auth.auth_hmac,
            },
        );
        debug!(endpoint = %id, "Sending connect");

        let timeout = self.mux.config().response_timeout();
        match self.mux.send_and_wait_for_response(id, connect, timeout).await {
            Ok(response) => match response.kind {
                WireMessageKind::ConnectSuccess { .. } => {
                    if self.mark(id, Step::ReceivedConnectResponse).completed {
                        self.approve(id);
                    }
                }
                WireMessageKind::ConnectFailure { reason } => {
                    warn!(endpoint = %id, reason = %reason, "Connect refused");
                    self.abort(id);
                }
                _ => {
                    warn!(endpoint = %id, kind = response.kind_name(), "Unexpected answer to connect");
                    self.abort(id);
                }
            },
            Err(e) if e.is_cancellation() => {
                debug!(endpoint = %id, "Connect abandoned, endpoint gone");
            }
            Err(e) => {
                warn!(endpoint = %id, error = %e, "Handshake failed");
                self.abort(id);
            }
        }
    }

    /// Handle a `Connect` received from `info`.
    pub async fn continue_handshake_with(
        &self,
        info: EndpointInformation,
        description: ProtocolDescription,
        connect_id: MessageId,
        auth: ConnectAuth,
    ) {
        let id = info.id.clone();
        if id == self.local {
            return;
        }
        if !self.is_reachable(&info) {
            debug!(endpoint = %id, "Ignoring connect from unreachable endpoint");
            return;
        }
        if self.store.can_communicate_with(&id) {
            if self.was_accepted(&id, connect_id) {
                self.answer(&id, connect_id).await;
                return;
            }
            // A new Connect from an approved endpoint means it lost its state.
            info!(endpoint = %id, "Approved endpoint connected again, restarting handshake");
            self.store.try_remove(&id);
        }
        if !self.store.try_add(&id, info.clone()) {
            self.refresh(info);
        }
        self.mark(&id, Step::ReceivedConnect);

        if !auth.verify(self.shared_secret.as_deref(), &id) {
            self.refuse(&id, connect_id, "authentication failed").await;
            return;
        }
        let local = self.description();
        if !allow_connection(&local, &description) {
            let reason = format!(
                "incompatible protocol: local version {} subjects {:?}",
                local.version,
                local.subjects.iter().map(|s| s.0.as_str()).collect::<Vec<_>>()
            );
            self.refuse(&id, connect_id, &reason).await;
            return;
        }

        self.store.try_start_approval(&id, description);

        if !self.answer(&id, connect_id).await {
            self.abort(&id);
            return;
        }
        self.accepted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), connect_id);
        if self.mark(&id, Step::SentConnectResponse).completed {
            self.approve(&id);
            return;
        }

        self.initiate_handshake(&id).await;
    }

    /// Accept the `Connect` identified by `connect_id`.
    async fn answer(&self, id: &EndpointId, connect_id: MessageId) -> bool {
        let Some(protocol) = self
            .store
            .try_get_connection_for(id)
            .and_then(|known| known.template())
            .and_then(|t| self.mux.local_info(t))
        else {
            return false;
        };
        let answer = WireMessage::response(
            self.local.clone(),
            connect_id,
            WireMessageKind::ConnectSuccess { protocol },
        );
        let retries = self.mux.config().max_send_retries;
        match self.mux.send_to(id, &answer, retries).await {
            Ok(()) => true,
            Err(e) => {
                warn!(endpoint = %id, error = %e, "Failed to answer connect");
                false
            }
        }
    }

    async fn refuse(&self, id: &EndpointId, connect_id: MessageId, reason: &str) {
        warn!(endpoint = %id, reason, "Refusing connect");
        let answer = WireMessage::response(
            self.local.clone(),
            connect_id,
            WireMessageKind::ConnectFailure {
                reason: reason.to_string(),
            },
        );
        if let Err(e) = self.mux.send_to(id, &answer, 0).await {
            debug!(endpoint = %id, error = %e, "Connect refusal not delivered");
        }
        self.abort(id);
    }

    /// Approve `id` once its connection information is complete. Until then
    /// the finished ticks are kept so a later [`Self::refresh`] can approve.
    fn approve(&self, id: &EndpointId) {
        match self.store.try_get_connection_for(id) {
            Some(info) if info.is_complete() => {
                self.forget(id);
                if self.store.try_complete_approval(id) {
                    info!(endpoint = %id, "Endpoint approved");
                }
            }
            _ => {
                warn!(endpoint = %id, "Cannot approve endpoint without complete connection information");
            }
        }
    }

    fn abort(&self, id: &EndpointId) {
        self.forget(id);
        self.forget_accepted(id);
        if self.store.try_remove(id) {
            debug!(endpoint = %id, "Endpoint removed after failed handshake");
        }
    }
}

impl DiscoverySink for HandshakeConductor {
    fn endpoint_available(&self, info: EndpointInformation) {
        if info.id == self.local {
            return;
        }
        if !self.is_reachable(&info) {
            debug!(endpoint = %info.id, "Discovered endpoint is not reachable from here");
            return;
        }
        self.begin(info);
    }

    fn endpoint_unavailable(&self, id: &EndpointId) {
        if id == &self.local {
            return;
        }
        self.forget(id);
        if self.store.try_remove(id) {
            info!(endpoint = %id, "Endpoint no longer available");
        }
    }
}

impl EndpointListener for HandshakeConductor {
    fn endpoint_disconnected(&self, id: &EndpointId) {
        self.forget(id);
        self.forget_accepted(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodelink_types::Version;

    fn description(subjects: &[&str]) -> ProtocolDescription {
        ProtocolDescription::new(Version::new(1, 0, 0), subjects.iter().copied())
    }

    #[test]
    fn test_allow_connection_requires_shared_subject() {
        assert!(allow_connection(&description(&["a", "b"]), &description(&["b"])));
        assert!(!allow_connection(&description(&["a"]), &description(&["b"])));
    }

    #[test]
    fn test_allow_connection_requires_same_version() {
        let newer = ProtocolDescription::new(Version::new(1, 1, 0), ["a"]);
        assert!(!allow_connection(&description(&["a"]), &newer));
    }

    #[test]
    fn test_ticks_complete_once() {
        let mut ticks = HandshakeTicks::default();
        for step in [
            Step::SentConnect,
            Step::ReceivedConnect,
            Step::SentConnectResponse,
        ] {
            *ticks.slot(step) = true;
            assert!(!ticks.is_complete());
        }
        *ticks.slot(Step::ReceivedConnectResponse) = true;
        assert!(ticks.is_complete());
    }
}
