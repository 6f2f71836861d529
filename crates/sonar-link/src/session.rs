//! Session lifecycle: connect with bounded retry and exponential backoff.
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting{n} ──ok──▶ Connected ──close()──▶ Closing ──▶ Disconnected
//!                                 │  ▲
//!                   transient err │  │ backoff(n), n < max_attempts
//!                                 ▼  │
//!                             Disconnected
//! ```
//!
//! Terminal errors (logged out, no credentials) return immediately. Callers
//! only ever see `connect()` resolving to a live connection or failing for good.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::connection::{Connection, LinkError, Result};

/// Opens raw connections. One call, one attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Connection;

    async fn open(&self) -> Result<Self::Connection>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    Closing,
}

/// Bounded exponential backoff between connection attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): doubles each time, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << shift)
            .min(self.max_backoff)
    }
}

/// Owns a connector and the connection it produced.
pub struct Session<C: Connector> {
    connector: C,
    policy: RetryPolicy,
    state: ConnectionState,
    connection: Option<Arc<C::Connection>>,
}

impl<C: Connector> Session<C> {
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            state: ConnectionState::Disconnected,
            connection: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Resolve once connected. Returns the existing connection if already up.
    pub async fn connect(&mut self) -> Result<Arc<C::Connection>> {
        if let Some(conn) = &self.connection {
            return Ok(Arc::clone(conn));
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.transition(ConnectionState::Connecting { attempt });

            match self.connector.open().await {
                Ok(conn) => {
                    let conn = Arc::new(conn);
                    self.connection = Some(Arc::clone(&conn));
                    self.transition(ConnectionState::Connected);
                    return Ok(conn);
                }
                Err(e) if e.is_terminal() => {
                    self.transition(ConnectionState::Disconnected);
                    tracing::error!(error = %e, "Connection rejected, not retrying");
                    return Err(e);
                }
                Err(e) => {
                    self.transition(ConnectionState::Disconnected);
                    if attempt >= max_attempts {
                        return Err(LinkError::RetriesExhausted {
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(
                        attempt,
                        error = %e,
                        backoff_ms = delay.as_millis() as u64,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Drop the current connection (e.g. after the remote closed it) and
    /// connect again under the same retry policy.
    pub async fn reconnect(&mut self) -> Result<Arc<C::Connection>> {
        if self.connection.take().is_some() {
            self.transition(ConnectionState::Disconnected);
        }
        self.connect().await
    }

    pub async fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            self.transition(ConnectionState::Closing);
            conn.close().await;
        }
        self.transition(ConnectionState::Disconnected);
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "Connection state change");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConnector, SimNetwork};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(300));
        assert_eq!(p.backoff(30), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_then_connects() {
        let connector = SimConnector::new(SimNetwork::new()).failing_first(2);
        let mut session = Session::new(connector, policy(5));

        let start = tokio::time::Instant::now();
        session.connect().await.unwrap();

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.connector.attempts(), 3);
        // 100ms + 200ms of backoff
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let connector = SimConnector::new(SimNetwork::new()).failing_first(10);
        let mut session = Session::new(connector, policy(3));

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, LinkError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn logged_out_is_not_retried() {
        let connector = SimConnector::new(SimNetwork::new()).logged_out();
        let mut session = Session::new(connector, policy(5));

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, LinkError::LoggedOut));
        assert_eq!(session.connector.attempts(), 1);
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_close_resets() {
        let connector = SimConnector::new(SimNetwork::new());
        let mut session = Session::new(connector, policy(1));

        let a = session.connect().await.unwrap();
        let b = session.connect().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(session.connector.attempts(), 1);

        session.close().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(matches!(
            a.send_delete("1@s.whatsapp.net", "PROBE_x").await,
            Err(LinkError::Closed)
        ));
    }

    #[tokio::test]
    async fn reconnect_opens_a_fresh_connection() {
        let connector = SimConnector::new(SimNetwork::new());
        let mut session = Session::new(connector, policy(1));

        session.connect().await.unwrap();
        session.reconnect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.connector.attempts(), 2);
    }
}
