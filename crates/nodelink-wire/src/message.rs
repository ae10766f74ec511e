//! Wire protocol message types.
//!
//! Every message carries its own id, the id of the message it answers
//! ([`MessageId::NONE`] when it answers nothing) and the sender. Stream
//! transports frame each message with a 4-byte big-endian length header
//! followed by the JSON body.

use nodelink_types::{
    EndpointId, MessageId, ProtocolDescription, ProtocolInformation, UploadToken,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum single message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// A wire protocol message (envelope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Unique message ID.
    pub id: MessageId,
    /// ID of the message this one answers.
    pub in_response_to: MessageId,
    /// Endpoint that produced the message.
    pub sender: EndpointId,
    /// Message variant.
    #[serde(flatten)]
    pub kind: WireMessageKind,
}

/// The different kinds of wire messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessageKind {
    /// Handshake proposal carrying the sender's reachability and description.
    Connect {
        protocol: ProtocolInformation,
        description: ProtocolDescription,
        /// Random nonce for HMAC authentication.
        #[serde(default)]
        nonce: String,
        /// HMAC-SHA256(shared_secret, nonce + endpoint uuid).
        #[serde(default)]
        auth_hmac: String,
    },
    /// The proposal was accepted.
    ConnectSuccess { protocol: ProtocolInformation },
    /// The proposal was rejected.
    ConnectFailure { reason: String },
    /// The sender is signing out.
    EndpointDisconnecting,
    /// Keep-alive probe with optional custom data.
    ConnectionVerification {
        #[serde(default)]
        payload: Option<Value>,
    },
    /// Answer to a keep-alive probe.
    ConnectionVerificationResponse {
        #[serde(default)]
        payload: Option<Value>,
    },
    /// Generic positive answer.
    Success,
    /// Generic negative answer.
    Failure { reason: String },
    /// Nothing on the receiving side handles the message.
    UnknownMessageType,
    /// Request to run a named command.
    CommandInvoked { command: String, arguments: Value },
    /// Result of a command.
    CommandResponse { result: Value },
    /// Request for the file registered under `token`.
    DataDownloadRequest { token: UploadToken },
    /// Application payload, opaque to the protocol layer.
    Application { topic: String, payload: Value },
}

impl WireMessage {
    /// A fresh message that answers nothing.
    pub fn new(sender: EndpointId, kind: WireMessageKind) -> Self {
        Self {
            id: MessageId::new(),
            in_response_to: MessageId::NONE,
            sender,
            kind,
        }
    }

    /// A fresh message answering `in_response_to`.
    pub fn response(sender: EndpointId, in_response_to: MessageId, kind: WireMessageKind) -> Self {
        Self {
            id: MessageId::new(),
            in_response_to,
            sender,
            kind,
        }
    }

    pub fn is_response(&self) -> bool {
        !self.in_response_to.is_none()
    }

    /// Part of the connect handshake.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self.kind,
            WireMessageKind::Connect { .. }
                | WireMessageKind::ConnectSuccess { .. }
                | WireMessageKind::ConnectFailure { .. }
        )
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self.kind, WireMessageKind::EndpointDisconnecting)
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            WireMessageKind::Connect { .. } => "connect",
            WireMessageKind::ConnectSuccess { .. } => "connect_success",
            WireMessageKind::ConnectFailure { .. } => "connect_failure",
            WireMessageKind::EndpointDisconnecting => "endpoint_disconnecting",
            WireMessageKind::ConnectionVerification { .. } => "connection_verification",
            WireMessageKind::ConnectionVerificationResponse { .. } => {
                "connection_verification_response"
            }
            WireMessageKind::Success => "success",
            WireMessageKind::Failure { .. } => "failure",
            WireMessageKind::UnknownMessageType => "unknown_message_type",
            WireMessageKind::CommandInvoked { .. } => "command_invoked",
            WireMessageKind::CommandResponse { .. } => "command_response",
            WireMessageKind::DataDownloadRequest { .. } => "data_download_request",
            WireMessageKind::Application { .. } => "application",
        }
    }
}

/// Encode a wire message to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &WireMessage) -> Result<Vec<u8>, serde_json::Error> {
    encode_frame(msg)
}

/// Encode any serializable value as a length-prefixed JSON frame.
pub(crate) fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(value)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a WireMessage.
pub fn decode_message(body: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodelink_types::Version;
    use url::Url;

    fn sender() -> EndpointId {
        EndpointId::new("alpha")
    }

    #[test]
    fn test_encode_decode_frame() {
        let msg = WireMessage::new(sender(), WireMessageKind::EndpointDisconnecting);
        let bytes = encode_message(&msg).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        let decoded = decode_message(&bytes[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_connect_serialization() {
        let protocol = ProtocolInformation::new(
            Version::new(1, 0, 0),
            Url::parse("tcp://10.0.0.1:4500").unwrap(),
            Url::parse("tcp://10.0.0.1:4501").unwrap(),
        );
        let msg = WireMessage::new(
            sender(),
            WireMessageKind::Connect {
                protocol,
                description: ProtocolDescription::new(Version::new(1, 0, 0), ["orders"]),
                nonce: String::new(),
                auth_hmac: String::new(),
            },
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"connect\""));
        assert!(json.contains("orders"));
        let decoded: WireMessage = serde_json::from_str(&json).unwrap();
        assert!(decoded.is_handshake());
        assert!(!decoded.is_response());
    }

    #[test]
    fn test_response_links_to_request() {
        let request = WireMessage::new(
            sender(),
            WireMessageKind::ConnectionVerification { payload: None },
        );
        let answer = WireMessage::response(
            sender(),
            request.id,
            WireMessageKind::ConnectionVerificationResponse { payload: None },
        );
        assert!(answer.is_response());
        assert_eq!(answer.in_response_to, request.id);
        assert_ne!(answer.id, request.id);
    }

    #[test]
    fn test_missing_optional_payload_defaults() {
        let json = format!(
            r#"{{"id":"{}","in_response_to":"{}","sender":{},"type":"connection_verification"}}"#,
            uuid::Uuid::new_v4(),
            uuid::Uuid::nil(),
            serde_json::to_string(&sender()).unwrap(),
        );
        let decoded: WireMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(
            decoded.kind,
            WireMessageKind::ConnectionVerification { payload: None }
        );
    }

    #[test]
    fn test_disconnect_and_handshake_classification() {
        let bye = WireMessage::new(sender(), WireMessageKind::EndpointDisconnecting);
        assert!(bye.is_disconnect());
        assert!(!bye.is_handshake());
        assert_eq!(bye.kind_name(), "endpoint_disconnecting");

        let failure = WireMessage::new(
            sender(),
            WireMessageKind::ConnectFailure {
                reason: "no shared subject".into(),
            },
        );
        assert!(failure.is_handshake());
    }
}
