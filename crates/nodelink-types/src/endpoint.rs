//! Reachability information for endpoints and their channels.

use crate::id::EndpointId;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// A protocol version. Endpoints only talk when versions match exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The kind of transport a channel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelTemplate {
    /// Same-machine inter-process channel.
    LocalIpc,
    /// Network channel.
    Tcp,
}

impl ChannelTemplate {
    /// URL scheme used for addresses of this template.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::LocalIpc => "ipc",
            Self::Tcp => "tcp",
        }
    }

    /// Map a URL scheme back to its template.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "ipc" => Some(Self::LocalIpc),
            "tcp" => Some(Self::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalIpc => write!(f, "local_ipc"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// How to reach one endpoint's channel for a specific transport template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolInformation {
    /// Version of the channel protocol.
    pub version: Version,
    /// Where messages are delivered.
    pub message_address: Option<Url>,
    /// Where bulk data is delivered.
    pub data_address: Option<Url>,
}

impl ProtocolInformation {
    pub fn new(version: Version, message_address: Url, data_address: Url) -> Self {
        Self {
            version,
            message_address: Some(message_address),
            data_address: Some(data_address),
        }
    }

    /// Both addresses are known.
    pub fn is_complete(&self) -> bool {
        self.message_address.is_some() && self.data_address.is_some()
    }

    /// Transport template, derived from the message address scheme.
    pub fn template(&self) -> Option<ChannelTemplate> {
        self.message_address
            .as_ref()
            .and_then(|url| ChannelTemplate::from_scheme(url.scheme()))
    }
}

/// A reachable endpoint. Replaced, never mutated, when its addresses change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInformation {
    pub id: EndpointId,
    pub protocol: ProtocolInformation,
}

impl EndpointInformation {
    pub fn new(id: EndpointId, protocol: ProtocolInformation) -> Self {
        Self { id, protocol }
    }

    pub fn is_complete(&self) -> bool {
        self.protocol.is_complete()
    }

    pub fn template(&self) -> Option<ChannelTemplate> {
        self.protocol.template()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_template_from_message_address() {
        let info = ProtocolInformation::new(
            Version::new(1, 0, 0),
            url("tcp://127.0.0.1:4500"),
            url("tcp://127.0.0.1:4501"),
        );
        assert_eq!(info.template(), Some(ChannelTemplate::Tcp));

        let ipc = ProtocolInformation::new(
            Version::new(1, 0, 0),
            url("ipc://node-a/messages"),
            url("ipc://node-a/data"),
        );
        assert_eq!(ipc.template(), Some(ChannelTemplate::LocalIpc));
    }

    #[test]
    fn test_unknown_scheme_has_no_template() {
        let info = ProtocolInformation::new(
            Version::new(1, 0, 0),
            url("http://example.com"),
            url("http://example.com"),
        );
        assert_eq!(info.template(), None);
    }

    #[test]
    fn test_completeness_requires_both_addresses() {
        let mut info = ProtocolInformation::new(
            Version::new(1, 0, 0),
            url("tcp://127.0.0.1:1"),
            url("tcp://127.0.0.1:2"),
        );
        assert!(info.is_complete());
        info.data_address = None;
        assert!(!info.is_complete());
        assert_eq!(info.template(), Some(ChannelTemplate::Tcp));
    }

    #[test]
    fn test_version_ordering_and_display() {
        assert!(Version::new(1, 2, 0) > Version::new(1, 1, 9));
        assert_eq!(Version::new(2, 0, 1).to_string(), "2.0.1");
    }

    #[test]
    fn test_template_scheme_round_trip() {
        for template in [ChannelTemplate::LocalIpc, ChannelTemplate::Tcp] {
            assert_eq!(ChannelTemplate::from_scheme(template.scheme()), Some(template));
        }
    }
}
