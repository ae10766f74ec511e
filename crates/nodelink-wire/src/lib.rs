//! NodeLink protocol layer: peer-to-peer endpoints over local IPC and TCP.
//!
//! ## Architecture
//!
//! - **ProtocolLayer**: one per local endpoint; sign in, send, wait, transfer
//! - **EndpointApprovalStore**: who is known and who completed the handshake
//! - **HandshakeConductor**: the symmetric connect handshake
//! - **MessageCorrelator**: matches responses to waits and routes the rest
//! - **ConnectionLivenessMonitor**: keep-alive probes and eviction
//! - **Channel**: transport seam with TCP, unix socket and in-memory versions

pub mod actions;
pub mod approval;
pub mod auth;
pub mod channel;
pub mod commands;
pub mod correlator;
pub mod discovery;
pub mod error;
pub mod event;
pub mod handshake;
pub mod liveness;
pub mod message;
pub mod mux;
pub mod protocol;
pub mod retry;
pub mod transport;
pub mod upload;

pub use approval::{ApprovalState, EndpointApprovalStore, EndpointListener};
pub use channel::{never_cancelled, CancelSignal, Channel};
pub use commands::CommandHandler;
pub use correlator::{action_fn, MessageAction, MessageCorrelator, MessageFilter};
pub use discovery::{DiscoverySink, DiscoverySource, ManualDiscovery};
pub use error::{WireError, WireResult};
pub use event::ProtocolEvent;
pub use handshake::{allow_connection, HandshakeConductor};
pub use liveness::{ConnectionLivenessMonitor, KeepAliveHandler};
pub use message::{WireMessage, WireMessageKind};
pub use protocol::{ProtocolLayer, ProtocolSettings};
