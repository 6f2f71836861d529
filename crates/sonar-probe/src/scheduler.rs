//! Probe round scheduling.
//!
//! Each round spawns one tokio task per device, all probing concurrently over
//! the shared connection, and completes when the slowest probe has resolved
//! or timed out. Rounds repeat per [`RoundPolicy`] until the count is reached
//! or a shutdown is signalled. A shutdown never interrupts a running round.
//!
//! When driven through a [`Session`], a connection found closed between
//! rounds is re-established under the session's retry policy. Only a failed
//! reconnect ends the run.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;

use sonar_core::{Device, ProbeResult, RoundResult};
use sonar_link::{Connection, Connector, Session};

use crate::error::{ProbeError, Result};
use crate::persist::ResultSink;
use crate::probe::{self, DEFAULT_TIMEOUT};

/// How many rounds to run and how to pace them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundPolicy {
    /// Rounds to run; 0 runs until shutdown.
    pub count: u64,
    /// Pause between consecutive rounds.
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for RoundPolicy {
    fn default() -> Self {
        Self {
            count: 1,
            interval: Duration::from_secs(1),
            probe_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RoundPolicy {
    pub fn is_infinite(&self) -> bool {
        self.count == 0
    }
}

/// Runs probe rounds against a fixed device set.
pub struct RoundScheduler<C: Connection> {
    connection: Arc<C>,
    devices: Vec<Device>,
    policy: RoundPolicy,
    completed: u64,
}

impl<C: Connection> RoundScheduler<C> {
    /// Resolve every target to its linked devices. Fails if none resolve.
    pub async fn start(connection: Arc<C>, targets: &[String], policy: RoundPolicy) -> Result<Self> {
        let mut devices = Vec::new();
        for target in targets {
            let entries = connection.enumerate_devices(target).await?;
            tracing::info!(target_identity = %target, devices = entries.len(), "Devices enumerated");
            devices.extend(
                entries
                    .into_iter()
                    .map(|entry| Device::new(entry.identity, entry.device_id)),
            );
        }

        if devices.is_empty() {
            return Err(ProbeError::NoDevices {
                target: targets.join(", "),
            });
        }

        Ok(Self::with_devices(connection, devices, policy))
    }

    /// Connect through `session`, then [`RoundScheduler::start`]. Returns
    /// `Ok(None)` if shutdown is signalled before that finishes.
    pub async fn connect<K>(
        session: &mut Session<K>,
        targets: &[String],
        policy: RoundPolicy,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Self>>
    where
        K: Connector<Connection = C>,
    {
        let setup = async {
            match session.connect().await {
                Ok(connection) => {
                    tracing::info!("Connected");
                    Self::start(connection, targets, policy).await
                }
                Err(e) => Err(e.into()),
            }
        };

        tokio::select! {
            biased;

            () = wait_for_shutdown(shutdown) => {
                tracing::info!("Shutdown requested before the first round");
                Ok(None)
            }
            started = setup => started.map(Some),
        }
    }

    /// Use an already resolved device set.
    pub fn with_devices(connection: Arc<C>, devices: Vec<Device>, policy: RoundPolicy) -> Self {
        Self {
            connection,
            devices,
            policy,
            completed: 0,
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.connection
    }

    pub fn policy(&self) -> &RoundPolicy {
        &self.policy
    }

    pub fn rounds_completed(&self) -> u64 {
        self.completed
    }

    pub fn is_finished(&self) -> bool {
        !self.policy.is_infinite() && self.completed >= self.policy.count
    }

    /// Run the next round immediately, or `None` once the policy is spent.
    ///
    /// This is the lazy round sequence; [`RoundScheduler::run`] adds pacing
    /// and shutdown handling on top.
    pub async fn next_round(&mut self) -> Option<RoundResult> {
        if self.is_finished() {
            return None;
        }
        let round_no = self.completed + 1;
        let round = probe_round(
            &self.connection,
            &self.devices,
            self.policy.probe_timeout,
            round_no,
        )
        .await;
        self.completed = round_no;

        tracing::info!(
            round = round_no,
            devices = round.results.len(),
            online = round.online_count(),
            errors = round.error_count(),
            "Round complete"
        );
        Some(round)
    }

    /// Run rounds into `sink` until the policy is spent or `shutdown` turns
    /// true. Returns the number of rounds delivered.
    pub async fn run<S: ResultSink>(
        &mut self,
        sink: &mut S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<u64> {
        let mut delivered = 0;
        while self.ready_for_round(&mut shutdown, delivered).await {
            let Some(round) = self.next_round().await else {
                break;
            };
            sink.record(&round)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Like [`RoundScheduler::run`], but reconnects through `session` when
    /// the connection has closed before a round. Fails once a reconnect does.
    pub async fn run_with_session<S, K>(
        &mut self,
        session: &mut Session<K>,
        sink: &mut S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<u64>
    where
        S: ResultSink,
        K: Connector<Connection = C>,
    {
        let mut delivered = 0;
        while self.ready_for_round(&mut shutdown, delivered).await {
            if self.connection.is_closed() {
                tracing::warn!(round = self.completed + 1, "Connection closed, reconnecting");
                tokio::select! {
                    biased;

                    () = wait_for_shutdown(&mut shutdown) => {
                        tracing::info!(delivered, "Shutdown requested while reconnecting");
                        break;
                    }
                    reconnected = session.reconnect() => {
                        self.connection = reconnected?;
                        tracing::info!("Reconnected");
                    }
                }
            }
            let Some(round) = self.next_round().await else {
                break;
            };
            sink.record(&round)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Whether another round should start: the policy is not spent and no
    /// shutdown arrived, including during the pause after earlier rounds.
    async fn ready_for_round(&self, shutdown: &mut watch::Receiver<bool>, delivered: u64) -> bool {
        if self.is_finished() {
            return false;
        }
        let stop = *shutdown.borrow();
        if stop || (delivered > 0 && self.pause(shutdown).await) {
            tracing::info!(delivered, "Shutdown requested, stopping");
            return false;
        }
        true
    }

    /// Wait out the inter-round interval. Returns true if shutdown was
    /// signalled meanwhile.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = tokio::time::sleep(self.policy.interval);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                () = &mut delay => return false,
                changed = shutdown.changed() => match changed {
                    Ok(()) if *shutdown.borrow() => return true,
                    Ok(()) => {}
                    // Sender gone: nobody can ask us to stop any more.
                    Err(_) => {
                        (&mut delay).await;
                        return false;
                    }
                },
            }
        }
    }
}

/// Resolve once `shutdown` turns true. Never resolves if the sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Probe every device concurrently and collect results in device order.
pub async fn probe_round<C: Connection>(
    connection: &Arc<C>,
    devices: &[Device],
    timeout: Duration,
    round_no: u64,
) -> RoundResult {
    let started_at = Utc::now();
    let mut tasks = JoinSet::new();

    for (index, device) in devices.iter().enumerate() {
        let connection = Arc::clone(connection);
        let device = device.clone();
        tasks.spawn(async move {
            let result = probe::probe(connection.as_ref(), &device.identity, timeout).await;
            (index, result.with_label(device.label))
        });
    }

    let mut slots: Vec<Option<ProbeResult>> = vec![None; devices.len()];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => slots[index] = Some(result),
            Err(e) => tracing::error!(round = round_no, error = %e, "Probe task failed"),
        }
    }

    let results = slots
        .into_iter()
        .zip(devices)
        .map(|(slot, device)| {
            slot.unwrap_or_else(|| ProbeResult::failed(&device.label, started_at, "probe task failed"))
        })
        .collect();

    RoundResult {
        round: round_no,
        started_at,
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemorySink;
    use sonar_link::{ConnectionState, DeviceScript, LinkError, RetryPolicy, SimConnector, SimNetwork};
    use tokio::time::Instant;

    const TARGET: &str = "4915112345678@s.whatsapp.net";

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn policy(count: u64) -> RoundPolicy {
        RoundPolicy {
            count,
            interval: ms(1000),
            probe_timeout: ms(5000),
        }
    }

    fn network() -> Arc<SimNetwork> {
        Arc::new(
            SimNetwork::new()
                .with_device(TARGET, 0, DeviceScript::online(ms(120), ms(340)))
                .with_device(TARGET, 1, DeviceScript::offline(ms(120))),
        )
    }

    #[tokio::test]
    async fn start_resolves_labelled_devices() {
        let sched = RoundScheduler::start(network(), &[TARGET.to_string()], policy(1))
            .await
            .unwrap();
        let labels: Vec<&str> = sched.devices().iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["Phone", "Companion 1"]);
        assert!(sched.devices()[0].is_main);
    }

    #[tokio::test]
    async fn start_fails_without_devices() {
        let err = RoundScheduler::start(
            Arc::new(SimNetwork::new()),
            &["nobody@s.whatsapp.net".to_string()],
            policy(1),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ProbeError::NoDevices { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn round_waits_for_slowest_probe_only() {
        let mut sched = RoundScheduler::start(network(), &[TARGET.to_string()], policy(1))
            .await
            .unwrap();

        let start = Instant::now();
        let round = sched.next_round().await.unwrap();

        // max(340ms, 5000ms), not the sum
        assert_eq!(start.elapsed(), ms(5000));
        assert_eq!(round.results.len(), 2);
        assert!(sched.next_round().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn finite_policy_runs_exact_count_with_pauses() {
        let mut sched = RoundScheduler::start(network(), &[TARGET.to_string()], policy(3))
            .await
            .unwrap();
        let (_tx, rx) = watch::channel(false);
        let mut sink = MemorySink::default();

        let start = Instant::now();
        let delivered = sched.run(&mut sink, rx).await.unwrap();

        assert_eq!(delivered, 3);
        assert_eq!(sink.rounds().len(), 3);
        let numbers: Vec<u64> = sink.rounds().iter().map(|r| r.round).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        // three 5s rounds, two 1s pauses
        assert_eq!(start.elapsed(), ms(17_000));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_before_start_runs_nothing() {
        let mut sched = RoundScheduler::start(network(), &[TARGET.to_string()], policy(0))
            .await
            .unwrap();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let mut sink = MemorySink::default();
        assert_eq!(sched.run(&mut sink, rx).await.unwrap(), 0);
        assert!(sink.rounds().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_pause_stops_infinite_run() {
        let mut sched = RoundScheduler::start(network(), &[TARGET.to_string()], policy(0))
            .await
            .unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            // Lands in the pause after round 2 (rounds end at 5s and 11s).
            tokio::time::sleep(ms(11_500)).await;
            let _ = tx.send(true);
        });

        let mut sink = MemorySink::default();
        let delivered = sched.run(&mut sink, rx).await.unwrap();
        assert_eq!(delivered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_shutdown_sender_does_not_stop_run() {
        let mut sched = RoundScheduler::start(network(), &[TARGET.to_string()], policy(2))
            .await
            .unwrap();
        let (tx, rx) = watch::channel(false);
        drop(tx);

        let mut sink = MemorySink::default();
        assert_eq!(sched.run(&mut sink, rx).await.unwrap(), 2);
    }

    fn online_network() -> SimNetwork {
        SimNetwork::new().with_device(TARGET, 0, DeviceScript::online(ms(120), ms(340)))
    }

    fn retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: ms(500),
            max_backoff: ms(4000),
        }
    }

    /// Close `connection` at `at`, which should fall in a pause between rounds.
    fn close_at(connection: Arc<SimNetwork>, at: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(at).await;
            connection.close().await;
        });
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connection_is_replaced_between_rounds() {
        let mut session = Session::new(SimConnector::new(online_network()), retry(3));
        let (_tx, mut rx) = watch::channel(false);
        let mut sched = RoundScheduler::connect(&mut session, &[TARGET.to_string()], policy(3), &mut rx)
            .await
            .unwrap()
            .unwrap();
        let first = Arc::clone(sched.connection());
        // Round 1 ends at 340ms, round 2 starts at 1340ms.
        close_at(Arc::clone(&first), ms(800));

        let mut sink = MemorySink::default();
        let delivered = sched.run_with_session(&mut session, &mut sink, rx).await.unwrap();

        assert_eq!(delivered, 3);
        assert!(sink.rounds().iter().all(|r| r.online_count() == 1 && r.error_count() == 0));
        assert!(first.is_closed());
        assert!(!sched.connection().is_closed());
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connection_without_session_keeps_failing() {
        let connection = Arc::new(online_network());
        let mut sched = RoundScheduler::start(Arc::clone(&connection), &[TARGET.to_string()], policy(2))
            .await
            .unwrap();
        close_at(connection, ms(800));

        let (_tx, rx) = watch::channel(false);
        let mut sink = MemorySink::default();
        sched.run(&mut sink, rx).await.unwrap();

        let second = &sink.rounds()[1].results[0];
        assert_eq!(second.error.as_deref(), Some("Connection closed"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnect_ends_the_run() {
        let connector = SimConnector::new(online_network()).logged_out_after(1);
        let mut session = Session::new(connector, retry(3));
        let (_tx, mut rx) = watch::channel(false);
        let mut sched = RoundScheduler::connect(&mut session, &[TARGET.to_string()], policy(0), &mut rx)
            .await
            .unwrap()
            .unwrap();
        close_at(Arc::clone(sched.connection()), ms(800));

        let mut sink = MemorySink::default();
        let err = sched
            .run_with_session(&mut session, &mut sink, rx)
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::Link(LinkError::LoggedOut)));
        assert_eq!(sink.rounds().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_connect_retries() {
        let connector = SimConnector::new(online_network()).failing_first(10);
        let mut session = Session::new(connector, retry(5));
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(ms(700)).await;
            let _ = tx.send(true);
        });

        let start = Instant::now();
        let started = RoundScheduler::connect(&mut session, &[TARGET.to_string()], policy(1), &mut rx)
            .await
            .unwrap();

        assert!(started.is_none());
        assert_eq!(start.elapsed(), ms(700));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_surfaces_terminal_errors() {
        let mut session = Session::new(SimConnector::new(online_network()).logged_out(), retry(5));
        let (_tx, mut rx) = watch::channel(false);

        let err = RoundScheduler::connect(&mut session, &[TARGET.to_string()], policy(1), &mut rx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProbeError::Link(LinkError::LoggedOut)));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_shutdown_ignores_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let waited = tokio::time::timeout(ms(5000), wait_for_shutdown(&mut rx)).await;
        assert!(waited.is_err());

        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        wait_for_shutdown(&mut rx).await;
    }
}
