//! Configuration for the sonar prober.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use sonar_core::RawStatus;
use sonar_link::{DeviceScript, RetryPolicy, ScriptedEvent, SimNetwork};

use crate::scheduler::RoundPolicy;

/// Top-level probe configuration.
///
/// Loaded from `sonar.toml` `[probe]` section or
/// `SONAR_PROBE__` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Per-probe timeout in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Pause between rounds in milliseconds.
    #[serde(default = "default_round_interval_ms")]
    pub round_interval_ms: u64,

    /// Number of rounds; 0 probes until interrupted.
    #[serde(default = "default_rounds")]
    pub rounds: u64,

    /// Where to write result files. Nothing is written when unset.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Domain appended to bare phone numbers.
    #[serde(default = "default_identity_domain")]
    pub identity_domain: String,

    #[serde(default)]
    pub connect: ConnectConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Connection retry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Devices of the simulated network the CLI probes.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_sim_devices")]
    pub devices: Vec<SimDeviceConfig>,

    /// Transient connection failures before the first successful connect.
    #[serde(default)]
    pub connect_failures: u32,
}

/// One simulated device. Ack times are measured from the send.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SimDeviceConfig {
    pub device_id: u32,

    #[serde(default)]
    pub send_latency_ms: u64,

    pub server_ack_ms: Option<u64>,

    /// Unset for a device that never acknowledges.
    pub client_ack_ms: Option<u64>,

    /// Make every send to this device fail with this message.
    pub send_error: Option<String>,

    #[serde(default = "default_true")]
    pub report_assigned_id: bool,
}

impl SimDeviceConfig {
    pub fn script(&self) -> DeviceScript {
        let latency = Duration::from_millis(self.send_latency_ms);
        if let Some(error) = &self.send_error {
            return DeviceScript::failing(latency, error.clone());
        }

        let mut script = DeviceScript::default()
            .with_send_latency(latency)
            .with_event(Duration::ZERO, ScriptedEvent::Upsert { status: RawStatus::Code(1) });
        if !self.report_assigned_id {
            script = script.without_assigned_id();
        }
        if let Some(at) = self.server_ack_ms {
            script = script.with_event(
                Duration::from_millis(at),
                ScriptedEvent::Status { status: "SERVER_ACK".into() },
            );
        }
        if let Some(at) = self.client_ack_ms {
            script = script.with_event(
                Duration::from_millis(at),
                ScriptedEvent::Status { status: "DELIVERY_ACK".into() },
            );
        }
        script
    }
}

impl SimulationConfig {
    /// Build a network where `target` owns every configured device.
    pub fn build_network(&self, target: &str) -> SimNetwork {
        self.devices
            .iter()
            .fold(SimNetwork::new(), |net, device| {
                net.with_device(target, device.device_id, device.script())
            })
    }
}

impl ProbeConfig {
    pub fn round_policy(&self) -> RoundPolicy {
        RoundPolicy {
            count: self.rounds,
            interval: Duration::from_millis(self.round_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }
}

impl ConnectConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_round_interval_ms() -> u64 {
    1000
}

fn default_rounds() -> u64 {
    1
}

fn default_identity_domain() -> String {
    "s.whatsapp.net".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8000
}

fn default_true() -> bool {
    true
}

fn default_sim_devices() -> Vec<SimDeviceConfig> {
    vec![
        SimDeviceConfig {
            device_id: 0,
            send_latency_ms: 120,
            server_ack_ms: Some(120),
            client_ack_ms: Some(340),
            send_error: None,
            report_assigned_id: true,
        },
        SimDeviceConfig {
            device_id: 1,
            send_latency_ms: 120,
            server_ack_ms: Some(120),
            client_ack_ms: None,
            send_error: None,
            report_assigned_id: true,
        },
    ]
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            round_interval_ms: default_round_interval_ms(),
            rounds: default_rounds(),
            output_dir: None,
            identity_domain: default_identity_domain(),
            connect: ConnectConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            devices: default_sim_devices(),
            connect_failures: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonar_link::Connection;

    fn from_toml(toml: &str) -> ProbeConfig {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .get::<ProbeConfig>("probe")
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = ProbeConfig::default();
        assert_eq!(config.probe_timeout_ms, 5000);
        assert_eq!(config.rounds, 1);
        assert_eq!(config.identity_domain, "s.whatsapp.net");
        assert_eq!(config.connect.max_attempts, 5);
        assert_eq!(config.simulation.devices.len(), 2);

        let policy = config.round_policy();
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert_eq!(policy.probe_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = from_toml(
            r#"
            [probe]
            rounds = 0
            output_dir = "results"

            [probe.connect]
            max_attempts = 2

            [[probe.simulation.devices]]
            device_id = 0
            client_ack_ms = 250
            "#,
        );

        assert_eq!(config.rounds, 0);
        assert!(config.round_policy().is_infinite());
        assert_eq!(config.output_dir, Some(PathBuf::from("results")));
        assert_eq!(config.connect.max_attempts, 2);
        assert_eq!(config.connect.initial_backoff_ms, 500);
        assert_eq!(config.probe_timeout_ms, 5000);

        let devices = &config.simulation.devices;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].client_ack_ms, Some(250));
        assert!(devices[0].report_assigned_id);
    }

    #[test]
    fn test_failing_device_script() {
        let device = SimDeviceConfig {
            device_id: 2,
            send_latency_ms: 10,
            server_ack_ms: None,
            client_ack_ms: None,
            send_error: Some("unreachable".to_string()),
            report_assigned_id: true,
        };
        let script = device.script();
        assert_eq!(script.send_error.as_deref(), Some("unreachable"));
        assert!(script.events.is_empty());
    }

    #[tokio::test]
    async fn test_simulation_registers_devices_under_target() {
        let net = SimulationConfig::default().build_network("1@s.whatsapp.net");
        let devices = net.enumerate_devices("1@s.whatsapp.net").await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].identity, "1:1@s.whatsapp.net");
    }
}
