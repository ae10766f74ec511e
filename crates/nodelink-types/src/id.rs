//! Identifiers shared by every NodeLink component.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies a process-level communication participant.
///
/// The local endpoint creates its id once at start-up; remote ids arrive over
/// the wire. The machine name is part of the identity because transport
/// selection depends on whether a peer lives on the same machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId {
    id: Uuid,
    machine: String,
}

impl EndpointId {
    /// Create a fresh endpoint id for a process running on `machine`.
    pub fn new(machine: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            machine: machine.into(),
        }
    }

    /// Rebuild an endpoint id from a known UUID (static peers, fixed node ids).
    pub fn with_id(id: Uuid, machine: impl Into<String>) -> Self {
        Self {
            id,
            machine: machine.into(),
        }
    }

    /// The unique part of the id.
    pub fn uuid(&self) -> Uuid {
        self.id
    }

    /// Name of the machine hosting the endpoint.
    pub fn machine(&self) -> &str {
        &self.machine
    }

    /// Whether the endpoint runs on the given machine (case-insensitive).
    pub fn is_on_machine(&self, machine: &str) -> bool {
        self.machine.eq_ignore_ascii_case(machine)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.machine, self.id)
    }
}

/// Unique identifier for a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Sentinel meaning "not a response to anything".
    pub const NONE: MessageId = MessageId(Uuid::nil());

    /// Create a new random MessageId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// True for the [`MessageId::NONE`] sentinel.
    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Process-local handle for a file registered for outbound transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UploadToken(pub u64);

impl fmt::Display for UploadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upload-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_id_equality_includes_machine() {
        let uuid = Uuid::new_v4();
        let a = EndpointId::with_id(uuid, "alpha");
        let b = EndpointId::with_id(uuid, "alpha");
        let c = EndpointId::with_id(uuid, "beta");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_endpoint_id_machine_match_is_case_insensitive() {
        let id = EndpointId::new("Build-Box");
        assert!(id.is_on_machine("build-box"));
        assert!(!id.is_on_machine("other"));
    }

    #[test]
    fn test_endpoint_id_display() {
        let uuid = Uuid::nil();
        let id = EndpointId::with_id(uuid, "host");
        assert_eq!(id.to_string(), format!("host/{uuid}"));
    }

    #[test]
    fn test_message_id_none_sentinel() {
        assert!(MessageId::NONE.is_none());
        assert!(!MessageId::new().is_none());
        assert_eq!(MessageId::NONE.to_string(), "none");
    }

    #[test]
    fn test_message_ids_are_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
    }
}
