//! Connection liveness monitoring.
//!
//! Every approved endpoint gets a record with the time its next check is due
//! and a count of consecutive failed probes. A timer probes the due
//! endpoints with a `ConnectionVerification` message; any other successful
//! exchange also counts as a confirmation. An endpoint that fails more
//! than `max_missed_keep_alive_signals` probes in a row is evicted from the
//! approval store.

use crate::approval::{EndpointApprovalStore, EndpointListener};
use crate::error::WireResult;
use async_trait::async_trait;
use dashmap::DashMap;
use nodelink_types::config::ProtocolConfig;
use nodelink_types::{EndpointId, EndpointInformation, ProtocolDescription};
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Sends one keep-alive probe and waits for the answer.
#[async_trait]
pub trait ConnectionVerifier: Send + Sync {
    /// Probe `endpoint`, returning the custom data of its answer.
    async fn verify(
        &self,
        endpoint: &EndpointId,
        payload: Option<Value>,
        timeout: Duration,
    ) -> WireResult<Option<Value>>;
}

type PayloadFn = Box<dyn Fn() -> Option<Value> + Send + Sync>;
type RespondFn = Box<dyn Fn(&EndpointId, Option<Value>) -> Option<Value> + Send + Sync>;
type ReceivedFn = Box<dyn Fn(&EndpointId, Value) + Send + Sync>;

/// Custom data carried by keep-alive probes.
pub struct KeepAliveHandler {
    outbound_payload: PayloadFn,
    respond_to: RespondFn,
    response_received: ReceivedFn,
}

impl KeepAliveHandler {
    /// A handler that sends and answers with no data.
    pub fn new() -> Self {
        Self {
            outbound_payload: Box::new(|| None),
            respond_to: Box::new(|_, _| None),
            response_received: Box::new(|_, _| {}),
        }
    }

    /// Data attached to every outbound probe.
    pub fn with_payload<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Option<Value> + Send + Sync + 'static,
    {
        self.outbound_payload = Box::new(f);
        self
    }

    /// Data returned when answering a peer's probe.
    pub fn with_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&EndpointId, Option<Value>) -> Option<Value> + Send + Sync + 'static,
    {
        self.respond_to = Box::new(f);
        self
    }

    /// Called with the data of every answered probe that carried some.
    pub fn on_response<F>(mut self, f: F) -> Self
    where
        F: Fn(&EndpointId, Value) + Send + Sync + 'static,
    {
        self.response_received = Box::new(f);
        self
    }
}

impl Default for KeepAliveHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct ConnectionRecord {
    next_check_due: Instant,
    failures: u32,
    probing: bool,
}

/// Keep-alive bookkeeping for approved endpoints.
pub struct ConnectionLivenessMonitor {
    store: Arc<EndpointApprovalStore>,
    config: ProtocolConfig,
    records: DashMap<EndpointId, ConnectionRecord>,
    handler: Mutex<Option<Arc<KeepAliveHandler>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionLivenessMonitor {
    pub fn new(store: Arc<EndpointApprovalStore>, config: ProtocolConfig) -> Self {
        Self {
            store,
            config,
            records: DashMap::new(),
            handler: Mutex::new(None),
            timer: Mutex::new(None),
        }
    }

    /// Start tracking `id`. Its first check is one confirmation interval away.
    pub fn track(&self, id: &EndpointId) {
        self.records.insert(
            id.clone(),
            ConnectionRecord {
                next_check_due: self.next_due(),
                failures: 0,
                probing: false,
            },
        );
    }

    pub fn untrack(&self, id: &EndpointId) {
        self.records.remove(id);
    }

    pub fn is_tracked(&self, id: &EndpointId) -> bool {
        self.records.contains_key(id)
    }

    /// Consecutive failed probes of `id`.
    pub fn failures(&self, id: &EndpointId) -> Option<u32> {
        self.records.get(id).map(|r| r.failures)
    }

    /// Traffic with `id` succeeded: reset its failure count and push the next
    /// check out by a full confirmation interval.
    pub fn confirm(&self, id: &EndpointId) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.failures = 0;
            record.next_check_due = self.next_due();
        }
    }

    /// Now plus one confirmation interval; intervals too large for an
    /// `Instant` fall back to a year.
    fn next_due(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.config.confirmation_interval())
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now)
    }

    /// Install the keep-alive handler. Returns false (and changes nothing)
    /// when one is already registered.
    pub fn register_handler(&self, handler: Arc<KeepAliveHandler>) -> bool {
        let mut slot = self.handler.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some(handler);
        true
    }

    /// Remove `handler` if it is the registered one.
    pub fn unregister_handler(&self, handler: &Arc<KeepAliveHandler>) -> bool {
        let mut slot = self.handler.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, handler) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    fn current_handler(&self) -> Option<Arc<KeepAliveHandler>> {
        self.handler.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Payload for an outbound probe.
    pub fn outbound_payload(&self) -> Option<Value> {
        self.current_handler()
            .and_then(|handler| (handler.outbound_payload)())
    }

    /// Payload for the answer to a probe from `sender`.
    pub fn respond_to(&self, sender: &EndpointId, payload: Option<Value>) -> Option<Value> {
        self.current_handler()
            .and_then(|handler| (handler.respond_to)(sender, payload))
    }

    /// Probe every endpoint whose check is due. Probes run on their own tasks;
    /// the returned handles complete once each probe has been accounted for.
    pub fn check_due_endpoints(
        self: &Arc<Self>,
        verifier: Arc<dyn ConnectionVerifier>,
    ) -> Vec<JoinHandle<()>> {
        let now = Instant::now();
        let mut due = Vec::new();
        for mut record in self.records.iter_mut() {
            if !record.probing && record.next_check_due <= now {
                record.probing = true;
                due.push(record.key().clone());
            }
        }

        due.into_iter()
            .map(|id| {
                let monitor = Arc::clone(self);
                let verifier = Arc::clone(&verifier);
                tokio::spawn(async move {
                    let payload = monitor.outbound_payload();
                    let timeout = monitor.config.response_timeout();
                    match verifier.verify(&id, payload, timeout).await {
                        Ok(data) => monitor.probe_succeeded(&id, data),
                        Err(e) => {
                            debug!(endpoint = %id, error = %e, "Keep-alive probe failed");
                            monitor.probe_failed(&id);
                        }
                    }
                })
            })
            .collect()
    }

    fn probe_succeeded(&self, id: &EndpointId, data: Option<Value>) {
        let tracked = match self.records.get_mut(id) {
            Some(mut record) => {
                record.failures = 0;
                record.probing = false;
                record.next_check_due = self.next_due();
                true
            }
            None => false,
        };
        if let (true, Some(data)) = (tracked, data) {
            if let Some(handler) = self.current_handler() {
                (handler.response_received)(id, data);
            }
        }
    }

    fn probe_failed(&self, id: &EndpointId) {
        let evict = match self.records.get_mut(id) {
            Some(mut record) => {
                record.failures += 1;
                record.probing = false;
                record.next_check_due = Instant::now();
                record.failures > self.config.max_missed_keep_alive_signals
            }
            None => false,
        };
        if evict {
            self.records.remove(id);
            warn!(
                endpoint = %id,
                max_missed = self.config.max_missed_keep_alive_signals,
                "Endpoint missed too many keep-alive signals, evicting"
            );
            self.store.try_remove(id);
        }
    }

    /// Run the keep-alive timer until [`Self::stop`] or until either side is dropped.
    pub fn start(self: &Arc<Self>, verifier: Weak<dyn ConnectionVerifier>) {
        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if timer.is_some() {
            return;
        }
        let period = self.config.keep_alive_interval();
        let monitor = Arc::downgrade(self);
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let (Some(monitor), Some(verifier)) = (monitor.upgrade(), verifier.upgrade())
                else {
                    break;
                };
                monitor.check_due_endpoints(verifier);
            }
        }));
        info!(interval_ms = period.as_millis() as u64, "Keep-alive timer started");
    }

    pub fn stop(&self) {
        let timer = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(timer) = timer {
            timer.abort();
            info!("Keep-alive timer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

impl EndpointListener for ConnectionLivenessMonitor {
    fn endpoint_connected(&self, info: &EndpointInformation, _description: &ProtocolDescription) {
        self.track(&info.id);
    }

    fn endpoint_disconnected(&self, id: &EndpointId) {
        self.untrack(id);
    }
}

impl Drop for ConnectionLivenessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WireError;
    use nodelink_types::{ProtocolInformation, Version};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use url::Url;

    struct ScriptedVerifier {
        healthy: AtomicBool,
        calls: AtomicUsize,
        answer: Option<Value>,
    }

    impl ScriptedVerifier {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                calls: AtomicUsize::new(0),
                answer: None,
            })
        }
    }

    #[async_trait]
    impl ConnectionVerifier for ScriptedVerifier {
        async fn verify(
            &self,
            _endpoint: &EndpointId,
            _payload: Option<Value>,
            timeout: Duration,
        ) -> WireResult<Option<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(self.answer.clone())
            } else {
                Err(WireError::ResponseTimedOut(timeout))
            }
        }
    }

    #[derive(Default)]
    struct Disconnects(AtomicUsize);

    impl EndpointListener for Disconnects {
        fn endpoint_disconnected(&self, _id: &EndpointId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(max_missed: u32) -> ProtocolConfig {
        ProtocolConfig {
            max_missed_keep_alive_signals: max_missed,
            keep_alive_interval_ms: 10,
            max_time_between_connection_confirmations_ms: 0,
            wait_for_response_timeout_ms: 50,
            max_send_retries: 0,
            max_inbound_data_bytes: 1 << 20,
        }
    }

    fn approve(store: &EndpointApprovalStore) -> EndpointId {
        let id = EndpointId::new("beta");
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

    struct Fixture {
        store: Arc<EndpointApprovalStore>,
        monitor: Arc<ConnectionLivenessMonitor>,
        disconnects: Arc<Disconnects>,
        id: EndpointId,
    }

    fn fixture(max_missed: u32) -> Fixture {
        let store = Arc::new(EndpointApprovalStore::new());
        let monitor = Arc::new(ConnectionLivenessMonitor::new(store.clone(), config(max_missed)));
        let disconnects = Arc::new(Disconnects::default());
        let as_listener: Arc<dyn EndpointListener> = monitor.clone();
        store.subscribe(Arc::downgrade(&as_listener));
        let counter: Arc<dyn EndpointListener> = disconnects.clone();
        store.subscribe(Arc::downgrade(&counter));
        let id = approve(&store);
        Fixture {
            store,
            monitor,
            disconnects,
            id,
        }
    }

    async fn tick(monitor: &Arc<ConnectionLivenessMonitor>, verifier: Arc<dyn ConnectionVerifier>) {
        for handle in monitor.check_due_endpoints(verifier) {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_approval_starts_tracking() {
        let f = fixture(3);
        assert!(f.monitor.is_tracked(&f.id));
        f.store.try_remove(&f.id);
        assert!(!f.monitor.is_tracked(&f.id));
    }

    #[tokio::test]
    async fn test_huge_confirmation_interval_does_not_overflow() {
        let store = Arc::new(EndpointApprovalStore::new());
        let config = ProtocolConfig {
            max_time_between_connection_confirmations_ms: u64::MAX,
            ..ProtocolConfig::default()
        };
        let monitor = ConnectionLivenessMonitor::new(store, config);
        let id = EndpointId::new("beta");

        monitor.track(&id);
        monitor.confirm(&id);
        let due = monitor.records.get(&id).unwrap().next_check_due;
        assert!(due > Instant::now() + Duration::from_secs(24 * 60 * 60));
    }

    #[tokio::test]
    async fn test_eviction_after_more_than_max_misses() {
        let f = fixture(2);
        let verifier = ScriptedVerifier::new(false);

        for expected in 1..=2 {
            tick(&f.monitor, verifier.clone()).await;
            assert_eq!(f.monitor.failures(&f.id), Some(expected));
            assert!(f.store.can_communicate_with(&f.id));
        }

        tick(&f.monitor, verifier.clone()).await;
        assert!(!f.store.is_known(&f.id));
        assert!(!f.monitor.is_tracked(&f.id));
        assert_eq!(f.disconnects.0.load(Ordering::SeqCst), 1);

        tick(&f.monitor, verifier.clone()).await;
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 3);
        assert_eq!(f.disconnects.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let f = fixture(3);
        let verifier = ScriptedVerifier::new(false);
        tick(&f.monitor, verifier.clone()).await;
        tick(&f.monitor, verifier.clone()).await;
        assert_eq!(f.monitor.failures(&f.id), Some(2));

        verifier.healthy.store(true, Ordering::SeqCst);
        tick(&f.monitor, verifier.clone()).await;
        assert_eq!(f.monitor.failures(&f.id), Some(0));
    }

    #[tokio::test]
    async fn test_confirm_resets_failures_and_defers_check() {
        let store = Arc::new(EndpointApprovalStore::new());
        let mut cfg = config(3);
        cfg.max_time_between_connection_confirmations_ms = 60_000;
        let monitor = Arc::new(ConnectionLivenessMonitor::new(store, cfg));
        let id = EndpointId::new("beta");
        monitor.records.insert(
            id.clone(),
            ConnectionRecord {
                next_check_due: Instant::now(),
                failures: 2,
                probing: false,
            },
        );

        monitor.confirm(&id);
        assert_eq!(monitor.failures(&id), Some(0));

        let verifier = ScriptedVerifier::new(true);
        tick(&monitor, verifier.clone()).await;
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_confirm_ignores_unknown_endpoint() {
        let f = fixture(3);
        let other = EndpointId::new("gamma");
        f.monitor.confirm(&other);
        assert!(!f.monitor.is_tracked(&other));
    }

    #[tokio::test]
    async fn test_response_data_reaches_handler() {
        let f = fixture(3);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler = Arc::new(
            KeepAliveHandler::new()
                .with_payload(|| Some(Value::from("ping")))
                .on_response(move |_, data| {
                    assert_eq!(data, Value::from("pong"));
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        );
        assert!(f.monitor.register_handler(handler));
        assert_eq!(f.monitor.outbound_payload(), Some(Value::from("ping")));

        let verifier = Arc::new(ScriptedVerifier {
            healthy: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            answer: Some(Value::from("pong")),
        });
        tick(&f.monitor, verifier).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_slot_is_single() {
        let store = Arc::new(EndpointApprovalStore::new());
        let monitor = ConnectionLivenessMonitor::new(store, config(3));
        let first = Arc::new(KeepAliveHandler::new().with_responder(|_, _| Some(Value::from(1))));
        let second = Arc::new(KeepAliveHandler::new());

        assert!(monitor.register_handler(first.clone()));
        assert!(!monitor.register_handler(second.clone()));
        assert!(!monitor.unregister_handler(&second));
        assert_eq!(monitor.respond_to(&EndpointId::new("x"), None), Some(Value::from(1)));

        assert!(monitor.unregister_handler(&first));
        assert_eq!(monitor.respond_to(&EndpointId::new("x"), None), None);
        assert!(monitor.register_handler(second));
    }

    #[tokio::test]
    async fn test_timer_evicts_unresponsive_endpoint() {
        let f = fixture(1);
        let verifier: Arc<dyn ConnectionVerifier> = ScriptedVerifier::new(false);
        f.monitor.start(Arc::downgrade(&verifier));
        assert!(f.monitor.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while f.store.is_known(&f.id) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!f.store.is_known(&f.id));

        f.monitor.stop();
        assert!(!f.monitor.is_running());
    }
}
