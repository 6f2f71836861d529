//! Single-device probe: send one ephemeral revoke and correlate its acks.
//!
//! The revoke is issued under a locally generated action id `E`, but the
//! network tracks it under an identifier it assigns itself. The probe learns
//! that identifier from whichever comes first: the send receipt, or our own
//! revoke of `E` showing up on the upsert stream. Status updates are only
//! meaningful once that binding exists, because they are keyed by it.
//!
//! Completion of the send is taken as a floor for the server ack. It marks
//! acceptance by the transport, which approximates (and may overstate the
//! precision of) the real server acknowledgement.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use uuid::Uuid;

use sonar_core::{AckLevel, ProbeResult, StatusUpdate, UpsertedAction};
use sonar_link::{Connection, SendReceipt, StatusBatch, UpsertBatch};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Immutable description of one in-flight probe.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub target: String,
    /// Locally generated id of the action being revoked.
    pub action_id: String,
    pub created_at: Instant,
    pub timestamp: DateTime<Utc>,
}

impl ProbeRequest {
    pub fn new(target: &str) -> Self {
        let timestamp = Utc::now();
        Self {
            target: target.to_string(),
            action_id: ephemeral_action_id(timestamp),
            created_at: Instant::now(),
            timestamp,
        }
    }
}

/// `PROBE_{epoch ms}_{random}`. The random part keeps concurrent probes
/// started in the same millisecond apart.
pub fn ephemeral_action_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("PROBE_{}_{}", now.timestamp_millis(), &suffix[..12])
}

/// When each acknowledgement was first seen. Each field is written once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckState {
    server_ack_at: Option<Instant>,
    client_ack_at: Option<Instant>,
}

impl AckState {
    pub fn server_ack_at(&self) -> Option<Instant> {
        self.server_ack_at
    }

    pub fn client_ack_at(&self) -> Option<Instant> {
        self.client_ack_at
    }

    pub fn is_resolved(&self) -> bool {
        self.client_ack_at.is_some()
    }

    /// Record progress to `level`. A client ack implies a server ack, so the
    /// server timestamp is filled first and can never trail the client one.
    fn advance(&mut self, level: AckLevel, now: Instant) {
        if self.is_resolved() {
            return;
        }
        if level.is_server_acked() && self.server_ack_at.is_none() {
            self.server_ack_at = Some(now);
        }
        if level.is_client_acked() {
            self.client_ack_at = Some(now);
        }
    }

    fn floor_server_ack(&mut self, now: Instant) {
        if self.server_ack_at.is_none() {
            self.server_ack_at = Some(now);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingSource {
    SendReceipt,
    Upsert,
}

/// The server-assigned identifier the probe's revoke is tracked under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub id: String,
    pub source: BindingSource,
}

/// Correlation state for one probe. Owned by the probe's task alone.
#[derive(Debug)]
pub struct Correlation {
    request: ProbeRequest,
    binding: Option<Binding>,
    acks: AckState,
    /// Events dropped by a lagging subscription.
    missed: u64,
}

impl Correlation {
    pub fn new(request: ProbeRequest) -> Self {
        Self {
            request,
            binding: None,
            acks: AckState::default(),
            missed: 0,
        }
    }

    pub fn request(&self) -> &ProbeRequest {
        &self.request
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    pub fn acks(&self) -> AckState {
        self.acks
    }

    pub fn is_resolved(&self) -> bool {
        self.acks.is_resolved()
    }

    /// Bind to `id` unless already bound. Returns whether this call bound.
    pub fn bind(&mut self, id: &str, source: BindingSource) -> bool {
        if self.binding.is_some() {
            return false;
        }
        tracing::debug!(
            action_id = %self.request.action_id,
            bound_id = %id,
            source = ?source,
            "Probe bound to server id"
        );
        self.binding = Some(Binding {
            id: id.to_string(),
            source,
        });
        true
    }

    /// Apply a status batch. Entries not keyed by the bound id are ignored,
    /// as is everything before a binding exists.
    pub fn observe_status(&mut self, batch: &[StatusUpdate], now: Instant) {
        let Some(binding) = &self.binding else {
            return;
        };
        for update in batch.iter().filter(|u| u.id == binding.id) {
            self.acks.advance(update.status.level(), now);
        }
    }

    /// Apply an upsert batch. Only our own revoke of this probe's action id
    /// counts; it may establish the binding.
    pub fn observe_upserts(&mut self, batch: &[UpsertedAction], now: Instant) {
        if self.is_resolved() {
            return;
        }
        for action in batch {
            if !action.is_own_revoke_of(&self.request.action_id) {
                continue;
            }
            self.bind(&action.id, BindingSource::Upsert);
            if let Some(status) = &action.status {
                self.acks.advance(status.level(), now);
            }
        }
    }

    /// Events were dropped before this probe could read them. One of them
    /// may have been its own acknowledgement.
    pub fn note_missed(&mut self, skipped: u64) {
        self.missed = self.missed.saturating_add(skipped);
    }

    /// The send completed.
    pub fn observe_send(&mut self, receipt: &SendReceipt, now: Instant) {
        if let Some(id) = &receipt.assigned_id {
            self.bind(id, BindingSource::SendReceipt);
        }
        self.acks.floor_server_ack(now);
    }

    /// An unresolved probe that missed events is not a trustworthy offline
    /// reading, so it carries an error instead.
    pub fn into_result(self) -> ProbeResult {
        let created_at = self.request.created_at;
        let error = (!self.is_resolved() && self.missed > 0)
            .then(|| format!("Event stream lagged, {} events missed", self.missed));
        let rtt = |at: Option<Instant>| {
            at.map(|t| t.saturating_duration_since(created_at).as_millis() as u64)
        };
        ProbeResult {
            label: self.request.target,
            timestamp: self.request.timestamp,
            server_rtt: rtt(self.acks.server_ack_at),
            client_rtt: rtt(self.acks.client_ack_at),
            error,
        }
    }
}

/// Both event subscriptions of one probe. Dropping it unsubscribes, so the
/// listeners are released on every exit path of [`probe`].
struct Subscription {
    status: broadcast::Receiver<StatusBatch>,
    upserts: broadcast::Receiver<UpsertBatch>,
}

impl Subscription {
    fn open<C: Connection + ?Sized>(conn: &C) -> Self {
        Self {
            status: conn.subscribe_status(),
            upserts: conn.subscribe_upserts(),
        }
    }
}

/// Probe `target` once.
///
/// Returns when the device acknowledges or `timeout` (measured from probe
/// creation) runs out. A timeout is an offline reading, not an error. A
/// failed send returns immediately with `error` set and no RTTs.
pub async fn probe<C: Connection + ?Sized>(conn: &C, target: &str, timeout: Duration) -> ProbeResult {
    let request = ProbeRequest::new(target);
    let deadline = request.created_at + timeout;
    let action_id = request.action_id.clone();
    let timestamp = request.timestamp;
    let mut correlation = Correlation::new(request);

    // Subscribe before sending: acks may beat the send receipt.
    let mut subscription = Subscription::open(conn);

    tracing::debug!(identity = %target, action_id = %action_id, "Sending probe");

    let send = conn.send_delete(target, &action_id);
    tokio::pin!(send);
    let expiry = tokio::time::sleep_until(deadline);
    tokio::pin!(expiry);

    let mut sending = true;
    let mut status_open = true;
    let mut upserts_open = true;

    while !correlation.is_resolved() {
        tokio::select! {
            biased;

            // Upserts first: a binding has to be in place before any status
            // update queued behind it is read, or that update is discarded.
            batch = subscription.upserts.recv(), if upserts_open => match batch {
                Ok(batch) => correlation.observe_upserts(&batch, Instant::now()),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(identity = %target, skipped, "Upsert stream lagged");
                    correlation.note_missed(skipped);
                }
                Err(RecvError::Closed) => upserts_open = false,
            },

            batch = subscription.status.recv(), if status_open => match batch {
                Ok(batch) => correlation.observe_status(&batch, Instant::now()),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(identity = %target, skipped, "Status stream lagged");
                    correlation.note_missed(skipped);
                }
                Err(RecvError::Closed) => status_open = false,
            },

            sent = &mut send, if sending => {
                sending = false;
                match sent {
                    Ok(receipt) => correlation.observe_send(&receipt, Instant::now()),
                    Err(e) => {
                        tracing::warn!(identity = %target, action_id = %action_id, error = %e, "Probe send failed");
                        return ProbeResult::failed(target, timestamp, e.to_string());
                    }
                }
            }

            () = &mut expiry => {
                tracing::debug!(identity = %target, action_id = %action_id, still_sending = sending, "Probe timed out");
                break;
            }
        }
    }

    drop(subscription);
    let result = correlation.into_result();
    tracing::debug!(
        identity = %target,
        server_rtt_ms = ?result.server_rtt,
        client_rtt_ms = ?result.client_rtt,
        "Probe finished"
    );
    result
}
