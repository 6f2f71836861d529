//! The connection trait and its error type.

use async_trait::async_trait;
use tokio::sync::broadcast;

use sonar_core::{StatusUpdate, UpsertedAction};

/// Errors from connection operations.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Session logged out")]
    LoggedOut,

    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("Gave up after {attempts} connection attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Device enumeration failed: {0}")]
    Enumeration(String),

    #[error("Connection closed")]
    Closed,
}

impl LinkError {
    /// Terminal errors are never retried by a [`crate::Session`].
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoggedOut | Self::NotAuthenticated(_))
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;

/// One batch of status updates, as delivered by the network.
pub type StatusBatch = Vec<StatusUpdate>;

/// One batch of newly observed actions.
pub type UpsertBatch = Vec<UpsertedAction>;

/// A device as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub identity: String,
    pub device_id: u32,
}

/// What the transport reports once a send has completed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    /// Identifier the network assigned to the sent action, when the transport
    /// knows it at send time.
    pub assigned_id: Option<String>,
}

/// A live session to the messaging network.
///
/// A single connection is shared by every concurrently running probe, so
/// both event streams must support any number of simultaneous subscribers.
/// Subscribing hands out a fresh receiver; dropping the receiver unsubscribes.
///
/// Receivers are bounded. A subscriber that falls more than the channel
/// capacity behind loses the oldest events, so implementations must size
/// both channels for the peak event rate across all probes sharing the
/// connection. Probes that lose events report an error rather than offline.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// List the devices linked to `identity`. May be empty.
    async fn enumerate_devices(&self, identity: &str) -> Result<Vec<DeviceEntry>>;

    /// Send a revoke of `action_id` toward `target`.
    async fn send_delete(&self, target: &str, action_id: &str) -> Result<SendReceipt>;

    /// Subscribe to batched status updates.
    fn subscribe_status(&self) -> broadcast::Receiver<StatusBatch>;

    /// Subscribe to upserts of newly observed actions.
    fn subscribe_upserts(&self) -> broadcast::Receiver<UpsertBatch>;

    /// Tear the session down. Subsequent sends fail with [`LinkError::Closed`].
    async fn close(&self);

    /// Whether the session has ended, through [`Connection::close`] or
    /// because the remote side dropped it.
    fn is_closed(&self) -> bool;
}
