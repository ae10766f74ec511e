//! What an endpoint can talk about, exchanged during the handshake.

use crate::endpoint::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Tag for an application domain. Endpoints connect only if they share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommunicationSubject(pub String);

impl CommunicationSubject {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for CommunicationSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommunicationSubject {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Subjects, protocol version and advertised commands of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolDescription {
    pub subjects: BTreeSet<CommunicationSubject>,
    pub version: Version,
    /// Names of the commands this endpoint can execute.
    #[serde(default)]
    pub commands: BTreeSet<String>,
}

impl ProtocolDescription {
    pub fn new<I, S>(version: Version, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CommunicationSubject>,
    {
        Self {
            subjects: subjects.into_iter().map(Into::into).collect(),
            version,
            commands: BTreeSet::new(),
        }
    }

    /// Versions are exactly equal and the subject sets intersect.
    pub fn is_compatible_with(&self, other: &ProtocolDescription) -> bool {
        self.version == other.version && !self.subjects.is_disjoint(&other.subjects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description(version: Version, subjects: &[&str]) -> ProtocolDescription {
        ProtocolDescription::new(version, subjects.iter().copied())
    }

    #[test]
    fn test_overlapping_subjects_are_compatible() {
        let v = Version::new(1, 0, 0);
        let local = description(v, &["A", "B"]);
        let remote = description(v, &["B", "C"]);
        assert!(local.is_compatible_with(&remote));
        assert!(remote.is_compatible_with(&local));
    }

    #[test]
    fn test_disjoint_subjects_are_incompatible() {
        let v = Version::new(1, 0, 0);
        let local = description(v, &["A", "B"]);
        let remote = description(v, &["C"]);
        assert!(!local.is_compatible_with(&remote));
    }

    #[test]
    fn test_version_mismatch_is_incompatible() {
        let local = description(Version::new(1, 0, 0), &["A", "B"]);
        let remote = description(Version::new(1, 1, 0), &["A", "B"]);
        assert!(!local.is_compatible_with(&remote));
    }

    #[test]
    fn test_empty_subjects_never_compatible() {
        let v = Version::new(1, 0, 0);
        let local = description(v, &[]);
        assert!(!local.is_compatible_with(&local.clone()));
    }
}
