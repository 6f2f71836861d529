//! Sonar Link: the connection seam between the prober and a messaging network.
//!
//! The prober never talks to a wire protocol directly. Everything it needs
//! (sending a revoke, enumerating devices, the two event streams) goes through
//! the [`Connection`] trait. Establishing a connection goes through a
//! [`Connector`], wrapped by [`Session`] which owns reconnection and backoff.

pub mod connection;
pub mod session;
pub mod sim;

pub use connection::{
    Connection, DeviceEntry, LinkError, Result, SendReceipt, StatusBatch, UpsertBatch,
};
pub use session::{ConnectionState, Connector, RetryPolicy, Session};
pub use sim::{DeviceScript, ScheduledEvent, ScriptedEvent, SimConnector, SimNetwork};
