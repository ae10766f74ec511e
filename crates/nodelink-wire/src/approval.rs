//! Endpoint approval store: the single source of truth for "can we talk to
//! this endpoint".
//!
//! Every known remote endpoint sits in exactly one [`ApprovalState`]. All
//! transitions go through one coarse lock; listeners are told about
//! connects and disconnects after the map has changed and the lock has been
//! released, so a listener may call straight back into the store.

use chrono::{DateTime, Utc};
use nodelink_types::{EndpointId, EndpointInformation, ProtocolDescription};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info};

/// Approval status of one remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalState {
    /// Discovered, connection info known, handshake not started.
    Contacted,
    /// Handshake in progress; carries the peer's description.
    WaitingForApproval(ProtocolDescription),
    /// Handshake complete.
    Approved {
        description: ProtocolDescription,
        since: DateTime<Utc>,
    },
}

impl ApprovalState {
    fn name(&self) -> &'static str {
        match self {
            Self::Contacted => "contacted",
            Self::WaitingForApproval(_) => "waiting_for_approval",
            Self::Approved { .. } => "approved",
        }
    }
}

#[derive(Debug, Clone)]
struct EndpointEntry {
    info: EndpointInformation,
    state: ApprovalState,
}

/// Observer of approval-store transitions.
pub trait EndpointListener: Send + Sync {
    /// An endpoint reached [`ApprovalState::Approved`].
    fn endpoint_connected(&self, _info: &EndpointInformation, _description: &ProtocolDescription) {}

    /// An endpoint left the store, from whatever state it was in.
    fn endpoint_disconnected(&self, _id: &EndpointId) {}
}

/// Thread-safe store of every known endpoint and its approval state.
pub struct EndpointApprovalStore {
    endpoints: Mutex<HashMap<EndpointId, EndpointEntry>>,
    listeners: Mutex<Vec<Weak<dyn EndpointListener>>>,
}

impl EndpointApprovalStore {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener. It is held weakly and dropped once its owner is gone.
    pub fn subscribe(&self, listener: Weak<dyn EndpointListener>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(listener);
    }

    fn live_listeners(&self) -> Vec<Arc<dyn EndpointListener>> {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|l| l.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }

    /// Insert `id` as [`ApprovalState::Contacted`] unless it is already known.
    pub fn try_add(&self, id: &EndpointId, info: EndpointInformation) -> bool {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        if endpoints.contains_key(id) {
            return false;
        }
        endpoints.insert(
            id.clone(),
            EndpointEntry {
                info,
                state: ApprovalState::Contacted,
            },
        );
        debug!(endpoint = %id, "Endpoint contacted");
        true
    }

    /// Contacted → WaitingForApproval.
    pub fn try_start_approval(&self, id: &EndpointId, description: ProtocolDescription) -> bool {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        match endpoints.get_mut(id) {
            Some(entry) if entry.state == ApprovalState::Contacted => {
                entry.state = ApprovalState::WaitingForApproval(description);
                debug!(endpoint = %id, "Endpoint waiting for approval");
                true
            }
            _ => false,
        }
    }

    /// WaitingForApproval → Approved, then notify listeners.
    pub fn try_complete_approval(&self, id: &EndpointId) -> bool {
        let approved = {
            let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
            match endpoints.get_mut(id) {
                Some(entry) => match &entry.state {
                    ApprovalState::WaitingForApproval(description) => {
                        let description = description.clone();
                        entry.state = ApprovalState::Approved {
                            description: description.clone(),
                            since: Utc::now(),
                        };
                        Some((entry.info.clone(), description))
                    }
                    _ => None,
                },
                None => None,
            }
        };

        match approved {
            Some((info, description)) => {
                info!(endpoint = %id, "Endpoint approved");
                for listener in self.live_listeners() {
                    listener.endpoint_connected(&info, &description);
                }
                true
            }
            None => false,
        }
    }

    /// Replace the connection info of a not-yet-approved endpoint.
    pub fn try_update(&self, info: EndpointInformation) -> bool {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        match endpoints.get_mut(&info.id) {
            Some(entry) if !matches!(entry.state, ApprovalState::Approved { .. }) => {
                entry.info = info;
                true
            }
            _ => false,
        }
    }

    pub fn has_been_contacted(&self, id: &EndpointId) -> bool {
        self.state_of(id) == Some(ApprovalState::Contacted)
    }

    pub fn is_waiting_for_approval(&self, id: &EndpointId) -> bool {
        matches!(self.state_of(id), Some(ApprovalState::WaitingForApproval(_)))
    }

    pub fn can_communicate_with(&self, id: &EndpointId) -> bool {
        matches!(self.state_of(id), Some(ApprovalState::Approved { .. }))
    }

    /// Whether `id` is known in any state.
    pub fn is_known(&self, id: &EndpointId) -> bool {
        let endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        endpoints.contains_key(id)
    }

    pub fn state_of(&self, id: &EndpointId) -> Option<ApprovalState> {
        let endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        endpoints.get(id).map(|entry| entry.state.clone())
    }

    /// Connection info for `id`, whatever its approval state.
    pub fn try_get_connection_for(&self, id: &EndpointId) -> Option<EndpointInformation> {
        let endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        endpoints.get(id).map(|entry| entry.info.clone())
    }

    /// Description received from `id` during the handshake.
    pub fn description_for(&self, id: &EndpointId) -> Option<ProtocolDescription> {
        match self.state_of(id)? {
            ApprovalState::Contacted => None,
            ApprovalState::WaitingForApproval(description)
            | ApprovalState::Approved { description, .. } => Some(description),
        }
    }

    /// When `id` was approved.
    pub fn approved_since(&self, id: &EndpointId) -> Option<DateTime<Utc>> {
        match self.state_of(id)? {
            ApprovalState::Approved { since, .. } => Some(since),
            _ => None,
        }
    }

    /// Remove `id` from whatever state it is in and notify listeners.
    ///
    /// Returns false when the endpoint was not known; nobody is notified then.
    pub fn try_remove(&self, id: &EndpointId) -> bool {
        let removed = {
            let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
            endpoints.remove(id)
        };

        match removed {
            Some(entry) => {
                info!(endpoint = %id, state = entry.state.name(), "Endpoint removed");
                for listener in self.live_listeners() {
                    listener.endpoint_disconnected(id);
                }
                true
            }
            None => false,
        }
    }

    /// Ids of all approved endpoints.
    pub fn approved_endpoints(&self) -> Vec<EndpointId> {
        let endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        endpoints
            .iter()
            .filter(|(_, entry)| matches!(entry.state, ApprovalState::Approved { .. }))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every endpoint, notifying listeners for each.
    pub fn clear(&self) {
        let removed: Vec<EndpointId> = {
            let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
            endpoints.drain().map(|(id, _)| id).collect()
        };
        if removed.is_empty() {
            return;
        }
        let listeners = self.live_listeners();
        for id in &removed {
            for listener in &listeners {
                listener.endpoint_disconnected(id);
            }
        }
        info!(count = removed.len(), "Approval store cleared");
    }
}

impl Default for EndpointApprovalStore {
    fn default() -> Self {
        Self::new()
    }
}
