//! Events published by the protocol layer.

use nodelink_types::{EndpointId, EndpointInformation, ProtocolDescription};
use std::path::PathBuf;

/// Something that happened to the set of reachable endpoints.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// The handshake with an endpoint completed.
    EndpointConnected {
        info: EndpointInformation,
        description: ProtocolDescription,
    },
    /// An endpoint signed out, was evicted or failed its handshake.
    EndpointDisconnected { id: EndpointId },
    /// An unsolicited data transfer finished.
    DataReceived {
        from: EndpointId,
        path: PathBuf,
        file_name: String,
    },
}
