//! Discovery seam: sources that report endpoints coming and going.

use crate::error::{WireError, WireResult};
use async_trait::async_trait;
use nodelink_types::config::StaticPeer;
use nodelink_types::{EndpointId, EndpointInformation, ProtocolInformation, Version};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;
use url::Url;

/// Receives discovery events.
pub trait DiscoverySink: Send + Sync {
    fn endpoint_available(&self, info: EndpointInformation);
    fn endpoint_unavailable(&self, id: &EndpointId);
}

/// A source of discovery events.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Start reporting to `sink`.
    async fn start_discovery(&self, sink: Arc<dyn DiscoverySink>) -> WireResult<()>;

    async fn end_discovery(&self) -> WireResult<()>;
}

/// Discovery from an explicit list of endpoints. Endpoints announced before
/// discovery starts are reported when it does.
#[derive(Default)]
pub struct ManualDiscovery {
    known: Mutex<HashMap<EndpointId, EndpointInformation>>,
    sink: Mutex<Option<Arc<dyn DiscoverySink>>>,
}

impl ManualDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configured static peers.
    pub fn from_peers(peers: &[StaticPeer], version: Version) -> WireResult<Self> {
        let discovery = Self::new();
        for peer in peers {
            discovery.announce(static_peer_info(peer, version)?);
        }
        Ok(discovery)
    }

    fn current_sink(&self) -> Option<Arc<dyn DiscoverySink>> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Report `info` as available.
    pub fn announce(&self, info: EndpointInformation) {
        {
            let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
            known.insert(info.id.clone(), info.clone());
        }
        if let Some(sink) = self.current_sink() {
            sink.endpoint_available(info);
        }
    }

    /// Report `id` as gone.
    pub fn withdraw(&self, id: &EndpointId) {
        let removed = {
            let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
            known.remove(id)
        };
        if removed.is_some() {
            if let Some(sink) = self.current_sink() {
                sink.endpoint_unavailable(id);
            }
        }
    }

    pub fn known(&self) -> Vec<EndpointInformation> {
        let known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        known.values().cloned().collect()
    }
}

#[async_trait]
impl DiscoverySource for ManualDiscovery {
    async fn start_discovery(&self, sink: Arc<dyn DiscoverySink>) -> WireResult<()> {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&sink));
        let known = self.known();
        debug!(count = known.len(), "Manual discovery started");
        for info in known {
            sink.endpoint_available(info);
        }
        Ok(())
    }

    async fn end_discovery(&self) -> WireResult<()> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }
}

/// Endpoint information for a configured static peer.
pub fn static_peer_info(peer: &StaticPeer, version: Version) -> WireResult<EndpointInformation> {
    let parse = |raw: &str| {
        Url::parse(raw).map_err(|e| WireError::InvalidAddress(format!("{raw}: {e}")))
    };
    Ok(EndpointInformation::new(
        EndpointId::with_id(peer.id, &peer.machine),
        ProtocolInformation::new(
            version,
            parse(&peer.message_address)?,
            parse(&peer.data_address)?,
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        available: Mutex<Vec<EndpointId>>,
        unavailable: Mutex<Vec<EndpointId>>,
    }

    impl DiscoverySink for Recorder {
        fn endpoint_available(&self, info: EndpointInformation) {
            self.available.lock().unwrap().push(info.id);
        }

        fn endpoint_unavailable(&self, id: &EndpointId) {
            self.unavailable.lock().unwrap().push(id.clone());
        }
    }

    fn peer(machine: &str) -> StaticPeer {
        StaticPeer {
            id: uuid::Uuid::new_v4(),
            machine: machine.to_string(),
            message_address: "tcp://10.0.0.2:4500".to_string(),
            data_address: "tcp://10.0.0.2:4501".to_string(),
        }
    }

    #[tokio::test]
    async fn test_announced_before_start_are_replayed() {
        let discovery = ManualDiscovery::from_peers(&[peer("beta")], Version::new(1, 0, 0)).unwrap();
        let recorder = Arc::new(Recorder::default());
        discovery.start_discovery(recorder.clone()).await.unwrap();
        assert_eq!(recorder.available.lock().unwrap().len(), 1);

        let later = static_peer_info(&peer("gamma"), Version::new(1, 0, 0)).unwrap();
        let later_id = later.id.clone();
        discovery.announce(later);
        discovery.withdraw(&later_id);
        discovery.withdraw(&later_id);
        assert_eq!(recorder.available.lock().unwrap().len(), 2);
        assert_eq!(*recorder.unavailable.lock().unwrap(), vec![later_id]);
    }

    #[tokio::test]
    async fn test_no_events_after_end() {
        let discovery = ManualDiscovery::new();
        let recorder = Arc::new(Recorder::default());
        discovery.start_discovery(recorder.clone()).await.unwrap();
        discovery.end_discovery().await.unwrap();
        discovery.announce(static_peer_info(&peer("beta"), Version::new(1, 0, 0)).unwrap());
        assert!(recorder.available.lock().unwrap().is_empty());
    }

    #[test]
    fn test_static_peer_with_bad_address() {
        let mut bad = peer("beta");
        bad.message_address = "not a url".into();
        assert!(matches!(
            static_peer_info(&bad, Version::new(1, 0, 0)),
            Err(WireError::InvalidAddress(_))
        ));
    }
}
