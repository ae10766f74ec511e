//! Built-in handlers for protocol-level messages.
//!
//! Actions run on the inbound path and must not block, so anything that
//! sends spawns a task. They hold the components they drive weakly; an
//! action outliving its protocol layer does nothing.

use crate::approval::EndpointApprovalStore;
use crate::auth::ConnectAuth;
use crate::commands::CommandRegistry;
use crate::correlator::{MessageAction, MessageCorrelator, MessageFilter};
use crate::handshake::HandshakeConductor;
use crate::message::{WireMessage, WireMessageKind};
use crate::mux::ChannelMultiplexer;
use nodelink_types::EndpointInformation;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Send `kind` as the answer to `request`, best effort.
fn reply(mux: Arc<ChannelMultiplexer>, request: &WireMessage, kind: WireMessageKind) {
    let answer = WireMessage::response(mux.local_id().clone(), request.id, kind);
    let to = request.sender.clone();
    tokio::spawn(async move {
        let retries = mux.config().max_send_retries;
        if let Err(e) = mux.send_to(&to, &answer, retries).await {
            debug!(endpoint = %to, kind = answer.kind_name(), error = %e, "Reply not delivered");
        }
    });
}

/// Hands `Connect` proposals to the handshake conductor.
pub struct ConnectAction {
    conductor: Weak<HandshakeConductor>,
}

impl MessageAction for ConnectAction {
    fn invoke(&self, message: WireMessage) {
        let Some(conductor) = self.conductor.upgrade() else {
            return;
        };
        let WireMessageKind::Connect {
            protocol,
            description,
            nonce,
            auth_hmac,
        } = message.kind
        else {
            return;
        };
        let info = EndpointInformation::new(message.sender, protocol);
        let auth = ConnectAuth { nonce, auth_hmac };
        tokio::spawn(async move {
            conductor
                .continue_handshake_with(info, description, message.id, auth)
                .await;
        });
    }
}

/// Removes endpoints that announce they are leaving.
pub struct EndpointDisconnectingAction {
    store: Arc<EndpointApprovalStore>,
}

impl MessageAction for EndpointDisconnectingAction {
    fn invoke(&self, message: WireMessage) {
        if self.store.try_remove(&message.sender) {
            info!(endpoint = %message.sender, "Endpoint signed out");
        }
    }
}

/// Answers keep-alive probes.
pub struct ConnectionVerificationAction {
    mux: Weak<ChannelMultiplexer>,
}

impl MessageAction for ConnectionVerificationAction {
    fn invoke(&self, message: WireMessage) {
        let Some(mux) = self.mux.upgrade() else {
            return;
        };
        let WireMessageKind::ConnectionVerification { payload } = &message.kind else {
            return;
        };
        let payload = mux.liveness().respond_to(&message.sender, payload.clone());
        reply(
            mux,
            &message,
            WireMessageKind::ConnectionVerificationResponse { payload },
        );
    }
}

/// Runs registered commands and returns their result.
pub struct CommandInvokedAction {
    mux: Weak<ChannelMultiplexer>,
    commands: Arc<CommandRegistry>,
}

impl MessageAction for CommandInvokedAction {
    fn invoke(&self, message: WireMessage) {
        let Some(mux) = self.mux.upgrade() else {
            return;
        };
        let commands = Arc::clone(&self.commands);
        tokio::spawn(async move {
            let WireMessageKind::CommandInvoked { command, arguments } = &message.kind else {
                return;
            };
            debug!(endpoint = %message.sender, command = %command, "Command invoked");
            let kind = match commands
                .dispatch(command, &message.sender, arguments.clone())
                .await
            {
                Ok(result) => WireMessageKind::CommandResponse { result },
                Err(reason) => {
                    warn!(endpoint = %message.sender, command = %command, reason = %reason, "Command failed");
                    WireMessageKind::Failure { reason }
                }
            };
            reply(mux, &message, kind);
        });
    }
}

/// Streams registered uploads to endpoints that ask for them.
pub struct DataDownloadRequestAction {
    mux: Weak<ChannelMultiplexer>,
}

impl MessageAction for DataDownloadRequestAction {
    fn invoke(&self, message: WireMessage) {
        let Some(mux) = self.mux.upgrade() else {
            return;
        };
        let WireMessageKind::DataDownloadRequest { token } = message.kind else {
            return;
        };
        tokio::spawn(async move {
            let kind = match mux.transfer_upload(&message.sender, token, message.id).await {
                Ok(()) => WireMessageKind::Success,
                Err(e) => {
                    warn!(endpoint = %message.sender, token = %token, error = %e, "Download request failed");
                    WireMessageKind::Failure {
                        reason: e.to_string(),
                    }
                }
            };
            reply(mux, &message, kind);
        });
    }
}

/// Tells the sender nobody here handles its message.
pub struct UnknownMessageTypeAction {
    mux: Weak<ChannelMultiplexer>,
}

impl MessageAction for UnknownMessageTypeAction {
    fn invoke(&self, message: WireMessage) {
        let Some(mux) = self.mux.upgrade() else {
            return;
        };
        debug!(endpoint = %message.sender, kind = message.kind_name(), "Unhandled message");
        reply(mux, &message, WireMessageKind::UnknownMessageType);
    }

    fn is_last_chance(&self) -> bool {
        true
    }
}

fn kind_filter(matches: fn(&WireMessageKind) -> bool) -> MessageFilter {
    Arc::new(move |message: &WireMessage| matches(&message.kind))
}

/// Register every built-in action on `correlator`.
pub fn install(
    correlator: &MessageCorrelator,
    store: &Arc<EndpointApprovalStore>,
    mux: &Arc<ChannelMultiplexer>,
    conductor: &Arc<HandshakeConductor>,
    commands: &Arc<CommandRegistry>,
) {
    correlator.act_on_arrival(
        kind_filter(|k| matches!(k, WireMessageKind::Connect { .. })),
        Arc::new(ConnectAction {
            conductor: Arc::downgrade(conductor),
        }),
    );
    correlator.act_on_arrival(
        kind_filter(|k| matches!(k, WireMessageKind::EndpointDisconnecting)),
        Arc::new(EndpointDisconnectingAction {
            store: Arc::clone(store),
        }),
    );
    correlator.act_on_arrival(
        kind_filter(|k| matches!(k, WireMessageKind::ConnectionVerification { .. })),
        Arc::new(ConnectionVerificationAction {
            mux: Arc::downgrade(mux),
        }),
    );
    correlator.act_on_arrival(
        kind_filter(|k| matches!(k, WireMessageKind::CommandInvoked { .. })),
        Arc::new(CommandInvokedAction {
            mux: Arc::downgrade(mux),
            commands: Arc::clone(commands),
        }),
    );
    correlator.act_on_arrival(
        kind_filter(|k| matches!(k, WireMessageKind::DataDownloadRequest { .. })),
        Arc::new(DataDownloadRequestAction {
            mux: Arc::downgrade(mux),
        }),
    );
    correlator.act_on_arrival(
        Arc::new(|_: &WireMessage| true),
        Arc::new(UnknownMessageTypeAction {
            mux: Arc::downgrade(mux),
        }),
    );
}
