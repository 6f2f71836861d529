//! In-process scripted network.
//!
//! `SimNetwork` behaves like a connection to a real network from the prober's
//! point of view: sends take time, the network re-keys every revoke under a
//! server-assigned identifier, and acknowledgements arrive later on the two
//! event streams. What happens after a send is scripted per device, with
//! event times measured from the moment the send was issued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use sonar_core::{ActionKind, RawStatus, StatusUpdate, UpsertedAction};

use crate::connection::{
    Connection, DeviceEntry, LinkError, Result, SendReceipt, StatusBatch, UpsertBatch,
};
use crate::session::Connector;

const EVENT_CAPACITY: usize = 256;

/// Something the network reports about a sent revoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedEvent {
    /// The revoke shows up on the upsert stream, referencing the original id.
    Upsert { status: RawStatus },
    /// A status update keyed by the server-assigned id.
    Status { status: RawStatus },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledEvent {
    /// Offset from the moment the send was issued.
    pub after: Duration,
    pub event: ScriptedEvent,
}

/// How one device reacts to a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceScript {
    pub send_latency: Duration,
    pub send_error: Option<String>,
    /// Whether the send call returns the server-assigned identifier.
    pub report_assigned_id: bool,
    pub events: Vec<ScheduledEvent>,
}

impl Default for DeviceScript {
    fn default() -> Self {
        Self {
            send_latency: Duration::ZERO,
            send_error: None,
            report_assigned_id: true,
            events: Vec::new(),
        }
    }
}

impl DeviceScript {
    /// Server ack when the send completes, device ack at `client_ack`.
    pub fn online(server_ack: Duration, client_ack: Duration) -> Self {
        Self {
            send_latency: server_ack,
            ..Self::default()
        }
        .with_event(Duration::ZERO, ScriptedEvent::Upsert { status: RawStatus::Code(1) })
        .with_event(server_ack, ScriptedEvent::Status { status: "SERVER_ACK".into() })
        .with_event(client_ack, ScriptedEvent::Status { status: "DELIVERY_ACK".into() })
    }

    /// The network accepts the revoke but the device never acknowledges it.
    pub fn offline(server_ack: Duration) -> Self {
        Self {
            send_latency: server_ack,
            ..Self::default()
        }
        .with_event(Duration::ZERO, ScriptedEvent::Upsert { status: RawStatus::Code(1) })
        .with_event(server_ack, ScriptedEvent::Status { status: "SERVER_ACK".into() })
    }

    /// The send itself fails after `latency`.
    pub fn failing(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            send_latency: latency,
            send_error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_event(mut self, after: Duration, event: ScriptedEvent) -> Self {
        self.events.push(ScheduledEvent { after, event });
        self
    }

    pub fn with_send_latency(mut self, latency: Duration) -> Self {
        self.send_latency = latency;
        self
    }

    pub fn without_assigned_id(mut self) -> Self {
        self.report_assigned_id = false;
        self
    }
}

/// A revoke the network received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentAction {
    pub target: String,
    pub action_id: String,
    pub assigned_id: String,
}

#[derive(Debug)]
struct SimShared {
    targets: Mutex<HashMap<String, Vec<DeviceEntry>>>,
    scripts: Mutex<HashMap<String, DeviceScript>>,
    sent: Mutex<Vec<SentAction>>,
    next_id: AtomicU64,
    status_tx: broadcast::Sender<StatusBatch>,
    upsert_tx: broadcast::Sender<UpsertBatch>,
}

/// Scripted network. Clones share devices, scripts, and event streams.
#[derive(Clone, Debug)]
pub struct SimNetwork {
    shared: Arc<SimShared>,
    closed: Arc<AtomicBool>,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNetwork {
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (upsert_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(SimShared {
                targets: Mutex::new(HashMap::new()),
                scripts: Mutex::new(HashMap::new()),
                sent: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                status_tx,
                upsert_tx,
            }),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a device under `target` and script its behaviour.
    pub fn with_device(self, target: &str, device_id: u32, script: DeviceScript) -> Self {
        let identity = device_identity(target, device_id);
        lock(&self.shared.targets)
            .entry(target.to_string())
            .or_default()
            .push(DeviceEntry {
                identity: identity.clone(),
                device_id,
            });
        lock(&self.shared.scripts).insert(identity, script);
        self
    }

    /// Number of live subscriptions across both event streams.
    pub fn listener_count(&self) -> usize {
        self.shared.status_tx.receiver_count() + self.shared.upsert_tx.receiver_count()
    }

    /// Every revoke received so far, in arrival order.
    pub fn sent(&self) -> Vec<SentAction> {
        lock(&self.shared.sent).clone()
    }

    /// Publish an arbitrary status batch.
    pub fn emit_status(&self, batch: StatusBatch) {
        let _ = self.shared.status_tx.send(batch);
    }

    /// Publish an arbitrary upsert batch.
    pub fn emit_upserts(&self, batch: UpsertBatch) {
        let _ = self.shared.upsert_tx.send(batch);
    }

    /// A handle sharing this network's state but with its own open/closed flag.
    fn reopened(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn assign_id(&self) -> String {
        let n = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        format!("3EB0{n:012X}")
    }

    fn schedule(&self, action_id: &str, assigned_id: &str, events: Vec<ScheduledEvent>) {
        if events.is_empty() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let action_id = action_id.to_string();
        let assigned_id = assigned_id.to_string();
        let issued_at = Instant::now();

        let mut events = events;
        events.sort_by_key(|e| e.after);

        tokio::spawn(async move {
            for scheduled in events {
                tokio::time::sleep_until(issued_at + scheduled.after).await;
                // No subscribers is fine; the event is simply unobserved.
                match scheduled.event {
                    ScriptedEvent::Upsert { status } => {
                        let _ = shared.upsert_tx.send(vec![UpsertedAction {
                            self_originated: true,
                            kind: ActionKind::Revoke,
                            target_action_id: Some(action_id.clone()),
                            id: assigned_id.clone(),
                            status: Some(status),
                        }]);
                    }
                    ScriptedEvent::Status { status } => {
                        let _ = shared
                            .status_tx
                            .send(vec![StatusUpdate::new(assigned_id.clone(), status)]);
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Connection for SimNetwork {
    async fn enumerate_devices(&self, identity: &str) -> Result<Vec<DeviceEntry>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        Ok(lock(&self.shared.targets)
            .get(identity)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_delete(&self, target: &str, action_id: &str) -> Result<SendReceipt> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let script = lock(&self.shared.scripts)
            .get(target)
            .cloned()
            .ok_or_else(|| LinkError::Send(format!("no route to {target}")))?;

        if let Some(error) = script.send_error {
            tokio::time::sleep(script.send_latency).await;
            return Err(LinkError::Send(error));
        }

        let assigned_id = self.assign_id();
        lock(&self.shared.sent).push(SentAction {
            target: target.to_string(),
            action_id: action_id.to_string(),
            assigned_id: assigned_id.clone(),
        });
        self.schedule(action_id, &assigned_id, script.events);

        tokio::time::sleep(script.send_latency).await;

        Ok(SendReceipt {
            assigned_id: script.report_assigned_id.then_some(assigned_id),
        })
    }

    fn subscribe_status(&self) -> broadcast::Receiver<StatusBatch> {
        self.shared.status_tx.subscribe()
    }

    fn subscribe_upserts(&self) -> broadcast::Receiver<UpsertBatch> {
        self.shared.upsert_tx.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Opens handles onto a [`SimNetwork`], optionally failing first.
pub struct SimConnector {
    network: SimNetwork,
    fail_first: u32,
    /// Attempts past this many are rejected as logged out.
    logged_out_after: Option<u32>,
    attempts: AtomicU32,
}

impl SimConnector {
    pub fn new(network: SimNetwork) -> Self {
        Self {
            network,
            fail_first: 0,
            logged_out_after: None,
            attempts: AtomicU32::new(0),
        }
    }

    /// Fail the first `n` attempts with a transient error.
    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    /// Reject every attempt as logged out.
    pub fn logged_out(self) -> Self {
        self.logged_out_after(0)
    }

    /// Let the first `n` attempts through, then reject as logged out.
    pub fn logged_out_after(mut self, n: u32) -> Self {
        self.logged_out_after = Some(n);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for SimConnector {
    type Connection = SimNetwork;

    async fn open(&self) -> Result<SimNetwork> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.logged_out_after.is_some_and(|n| attempt > n) {
            return Err(LinkError::LoggedOut);
        }
        if attempt <= self.fail_first {
            return Err(LinkError::Connect(format!(
                "simulated failure on attempt {attempt}"
            )));
        }
        Ok(self.network.reopened())
    }
}

/// Address of device `device_id` under `target`: the target itself for the
/// main device, `user:id@domain` for companions.
pub fn device_identity(target: &str, device_id: u32) -> String {
    if device_id == 0 {
        return target.to_string();
    }
    match target.split_once('@') {
        Some((user, domain)) => format!("{user}:{device_id}@{domain}"),
        None => format!("{target}:{device_id}"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
