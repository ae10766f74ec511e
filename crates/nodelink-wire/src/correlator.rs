//! Message correlation and dispatch.
//!
//! Inbound responses resolve the pending wait registered for the id they
//! answer. Everything else goes through the anti-spoofing gate and then to
//! the first registered filter that accepts it, or to the last-chance action
//! when none does.

use crate::approval::{EndpointApprovalStore, EndpointListener};
use crate::message::WireMessage;
use futures::future::{BoxFuture, FutureExt, Shared};
use nodelink_types::{EndpointId, MessageId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A wait ended without a response: the responder went away or the local
/// channel closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("response cancelled")]
pub struct ResponseCancelled;

/// Future of the response to one message. Every clone resolves to the same
/// outcome.
pub type ResponseFuture = Shared<BoxFuture<'static, Result<WireMessage, ResponseCancelled>>>;

/// Predicate deciding whether an action handles a message.
pub type MessageFilter = Arc<dyn Fn(&WireMessage) -> bool + Send + Sync>;

/// Handler for inbound non-response messages.
pub trait MessageAction: Send + Sync {
    fn invoke(&self, message: WireMessage);

    /// A last-chance action is not matched by filters; it receives whatever
    /// no filter accepted.
    fn is_last_chance(&self) -> bool {
        false
    }
}

struct FnAction<F>(F);

impl<F> MessageAction for FnAction<F>
where
    F: Fn(WireMessage) + Send + Sync,
{
    fn invoke(&self, message: WireMessage) {
        (self.0)(message)
    }
}

/// Wrap a closure as a [`MessageAction`].
pub fn action_fn<F>(f: F) -> Arc<dyn MessageAction>
where
    F: Fn(WireMessage) + Send + Sync + 'static,
{
    Arc::new(FnAction(f))
}

/// What [`MessageCorrelator::process_message`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Resolved a pending wait.
    Resolved,
    /// A response nobody waits for (already resolved, timed out or unknown).
    UnmatchedResponse,
    /// Sender is not approved and the message is neither handshake nor disconnect.
    Rejected,
    /// A filtered action took it.
    Handled,
    /// The last-chance action took it.
    LastChance,
    /// Nothing took it.
    Dropped,
}

struct PendingResponse {
    responder: EndpointId,
    resolver: oneshot::Sender<WireMessage>,
    future: ResponseFuture,
}

#[derive(Default)]
struct CorrelatorState {
    pending: HashMap<MessageId, PendingResponse>,
    filters: Vec<(MessageFilter, Arc<dyn MessageAction>)>,
    last_chance: Option<Arc<dyn MessageAction>>,
}

/// Routes inbound messages to waits and handlers.
pub struct MessageCorrelator {
    store: Arc<EndpointApprovalStore>,
    state: Mutex<CorrelatorState>,
}

impl MessageCorrelator {
    pub fn new(store: Arc<EndpointApprovalStore>) -> Self {
        Self {
            store,
            state: Mutex::new(CorrelatorState::default()),
        }
    }

    /// Future for the response to `in_response_to`, expected from
    /// `expected_responder`.
    ///
    /// Registering twice for the same id returns the same future. The
    /// responder is only used to cancel the wait when it disconnects;
    /// matching is by id alone.
    pub fn forward_response(
        &self,
        expected_responder: &EndpointId,
        in_response_to: MessageId,
    ) -> ResponseFuture {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pending) = state.pending.get(&in_response_to) {
            return pending.future.clone();
        }

        let (resolver, receiver) = oneshot::channel();
        let future = receiver
            .map(|result| result.map_err(|_| ResponseCancelled))
            .boxed()
            .shared();
        state.pending.insert(
            in_response_to,
            PendingResponse {
                responder: expected_responder.clone(),
                resolver,
                future: future.clone(),
            },
        );
        future
    }

    /// Drop the wait for `in_response_to`, cancelling its future.
    pub fn forget(&self, in_response_to: MessageId) {
        let removed = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pending.remove(&in_response_to)
        };
        drop(removed);
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }

    /// Register an action for messages accepted by `filter`. A last-chance
    /// action replaces the previous fallback and ignores `filter`.
    pub fn act_on_arrival(&self, filter: MessageFilter, action: Arc<dyn MessageAction>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if action.is_last_chance() {
            state.last_chance = Some(action);
        } else {
            state.filters.push((filter, action));
        }
    }

    /// Route one inbound message.
    pub fn process_message(&self, message: WireMessage) -> Dispatch {
        if message.is_response() {
            let pending = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.pending.remove(&message.in_response_to)
            };
            return match pending {
                Some(pending) => {
                    // The waiter may have given up already; nothing to do then.
                    let _ = pending.resolver.send(message);
                    Dispatch::Resolved
                }
                None => {
                    debug!(
                        in_response_to = %message.in_response_to,
                        kind = message.kind_name(),
                        "Response has no pending wait"
                    );
                    Dispatch::UnmatchedResponse
                }
            };
        }

        if !message.is_handshake()
            && !message.is_disconnect()
            && !self.store.can_communicate_with(&message.sender)
        {
            warn!(
                sender = %message.sender,
                kind = message.kind_name(),
                "Rejected message from unapproved endpoint"
            );
            return Dispatch::Rejected;
        }

        let (filters, last_chance) = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            (state.filters.clone(), state.last_chance.clone())
        };

        for (filter, action) in filters {
            if filter(&message) {
                action.invoke(message);
                return Dispatch::Handled;
            }
        }

        match last_chance {
            Some(action) => {
                action.invoke(message);
                Dispatch::LastChance
            }
            None => {
                debug!(kind = message.kind_name(), "No handler for message");
                Dispatch::Dropped
            }
        }
    }

    /// Cancel every wait expecting an answer from `id`.
    pub fn on_endpoint_disconnected(&self, id: &EndpointId) {
        let cancelled: Vec<PendingResponse> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<MessageId> = state
                .pending
                .iter()
                .filter(|(_, pending)| &pending.responder == id)
                .map(|(message_id, _)| *message_id)
                .collect();
            ids.iter()
                .filter_map(|message_id| state.pending.remove(message_id))
                .collect()
        };
        if !cancelled.is_empty() {
            debug!(endpoint = %id, count = cancelled.len(), "Cancelled pending responses");
        }
    }

    /// Cancel every wait.
    pub fn on_local_channel_closed(&self) {
        let cancelled: Vec<PendingResponse> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pending.drain().map(|(_, pending)| pending).collect()
        };
        if !cancelled.is_empty() {
            debug!(count = cancelled.len(), "Cancelled all pending responses");
        }
    }
}

impl EndpointListener for MessageCorrelator {
    fn endpoint_disconnected(&self, id: &EndpointId) {
        self.on_endpoint_disconnected(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::WireMessageKind;
    use nodelink_types::{EndpointInformation, ProtocolDescription, ProtocolInformation, Version};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use url::Url;

    fn approved(store: &EndpointApprovalStore, machine: &str) -> EndpointId {
        let id = EndpointId::new(machine);
        let info = EndpointInformation::new(
            id.clone(),
            ProtocolInformation::new(
                Version::new(1, 0, 0),
                Url::parse("tcp://127.0.0.1:1").unwrap(),
                Url::parse("tcp://127.0.0.1:2").unwrap(),
            ),
        );
        store.try_add(&id, info);
        store.try_start_approval(&id, ProtocolDescription::new(Version::new(1, 0, 0), ["x"]));
        store.try_complete_approval(&id);
        id
    }

    fn correlator() -> (MessageCorrelator, Arc<EndpointApprovalStore>) {
        let store = Arc::new(EndpointApprovalStore::new());
        (MessageCorrelator::new(store.clone()), store)
    }

    fn counting_action(counter: Arc<AtomicUsize>) -> Arc<dyn MessageAction> {
        action_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn always() -> MessageFilter {
        Arc::new(|_| true)
    }

    struct Fallback(Arc<AtomicUsize>);

    impl MessageAction for Fallback {
        fn invoke(&self, _message: WireMessage) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn is_last_chance(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_response_resolves_wait_exactly_once() {
        let (correlator, store) = correlator();
        let peer = approved(&store, "beta");
        let request = WireMessage::new(EndpointId::new("alpha"), WireMessageKind::Success);

        let wait = correlator.forward_response(&peer, request.id);
        let answer = WireMessage::response(peer.clone(), request.id, WireMessageKind::Success);
        assert_eq!(correlator.process_message(answer.clone()), Dispatch::Resolved);
        assert_eq!(wait.await.unwrap(), answer);

        let again = WireMessage::response(peer, request.id, WireMessageKind::Success);
        assert_eq!(correlator.process_message(again), Dispatch::UnmatchedResponse);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_forward_response_is_idempotent() {
        let (correlator, _store) = correlator();
        let peer = EndpointId::new("beta");
        let id = MessageId::new();
        let first = correlator.forward_response(&peer, id);
        let second = correlator.forward_response(&peer, id);
        assert_eq!(correlator.pending_count(), 1);

        let answer = WireMessage::response(peer, id, WireMessageKind::Success);
        correlator.process_message(answer.clone());
        assert_eq!(first.await.unwrap(), answer);
        assert_eq!(second.await.unwrap(), answer);
    }

    #[tokio::test]
    async fn test_responses_match_by_id_in_any_order() {
        let (correlator, _store) = correlator();
        let peer = EndpointId::new("beta");
        let (a, b) = (MessageId::new(), MessageId::new());
        let wait_a = correlator.forward_response(&peer, a);
        let wait_b = correlator.forward_response(&peer, b);

        correlator.process_message(WireMessage::response(
            peer.clone(),
            b,
            WireMessageKind::CommandResponse { result: "b".into() },
        ));
        correlator.process_message(WireMessage::response(
            peer,
            a,
            WireMessageKind::CommandResponse { result: "a".into() },
        ));
        assert_eq!(wait_a.await.unwrap().in_response_to, a);
        assert_eq!(wait_b.await.unwrap().in_response_to, b);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_only_that_responders_waits() {
        let (correlator, _store) = correlator();
        let gone = EndpointId::new("beta");
        let stays = EndpointId::new("gamma");
        let cancelled = correlator.forward_response(&gone, MessageId::new());
        let kept_id = MessageId::new();
        let kept = correlator.forward_response(&stays, kept_id);

        correlator.on_endpoint_disconnected(&gone);
        assert_eq!(cancelled.await, Err(ResponseCancelled));
        assert_eq!(correlator.pending_count(), 1);

        let answer = WireMessage::response(stays, kept_id, WireMessageKind::Success);
        correlator.process_message(answer.clone());
        assert_eq!(kept.await.unwrap(), answer);
    }

    #[tokio::test]
    async fn test_local_channel_close_cancels_everything() {
        let (correlator, _store) = correlator();
        let waits: Vec<_> = (0..3)
            .map(|i| correlator.forward_response(&EndpointId::new(format!("m{i}")), MessageId::new()))
            .collect();
        correlator.on_local_channel_closed();
        for wait in waits {
            assert_eq!(wait.await, Err(ResponseCancelled));
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_forget_cancels_wait() {
        let (correlator, _store) = correlator();
        let id = MessageId::new();
        let wait = correlator.forward_response(&EndpointId::new("beta"), id);
        correlator.forget(id);
        let result = tokio::time::timeout(Duration::from_secs(1), wait).await.unwrap();
        assert_eq!(result, Err(ResponseCancelled));
    }

    #[test]
    fn test_first_matching_filter_wins() {
        let (correlator, store) = correlator();
        let peer = approved(&store, "beta");
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let never = Arc::new(AtomicUsize::new(0));

        correlator.act_on_arrival(Arc::new(|_| false), counting_action(never.clone()));
        correlator.act_on_arrival(always(), counting_action(first.clone()));
        correlator.act_on_arrival(always(), counting_action(second.clone()));

        let msg = WireMessage::new(peer, WireMessageKind::Success);
        assert_eq!(correlator.process_message(msg), Dispatch::Handled);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(never.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_last_chance_runs_when_nothing_matches() {
        let (correlator, store) = correlator();
        let peer = approved(&store, "beta");
        let fallback = Arc::new(AtomicUsize::new(0));
        correlator.act_on_arrival(always(), Arc::new(Fallback(fallback.clone())));
        correlator.act_on_arrival(Arc::new(|_| false), counting_action(Arc::default()));

        let msg = WireMessage::new(peer, WireMessageKind::Success);
        assert_eq!(correlator.process_message(msg), Dispatch::LastChance);
        assert_eq!(fallback.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unapproved_sender_is_rejected_except_handshake_and_disconnect() {
        let (correlator, _store) = correlator();
        let hits = Arc::new(AtomicUsize::new(0));
        correlator.act_on_arrival(always(), counting_action(hits.clone()));
        let stranger = EndpointId::new("mallory");

        let app = WireMessage::new(stranger.clone(), WireMessageKind::Success);
        assert_eq!(correlator.process_message(app), Dispatch::Rejected);

        let failure = WireMessage::new(
            stranger.clone(),
            WireMessageKind::ConnectFailure {
                reason: "no".into(),
            },
        );
        assert_eq!(correlator.process_message(failure), Dispatch::Handled);

        let bye = WireMessage::new(stranger, WireMessageKind::EndpointDisconnecting);
        assert_eq!(correlator.process_message(bye), Dispatch::Handled);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_action_may_register_more_actions() {
        let (correlator, store) = correlator();
        let correlator = Arc::new(correlator);
        let peer = approved(&store, "beta");

        let inner = correlator.clone();
        correlator.act_on_arrival(
            always(),
            action_fn(move |_| inner.act_on_arrival(always(), action_fn(|_| {}))),
        );
        let msg = WireMessage::new(peer, WireMessageKind::Success);
        assert_eq!(correlator.process_message(msg), Dispatch::Handled);
    }
}
