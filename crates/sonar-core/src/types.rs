//! Core domain types for presence probing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Devices ───────────────────────────────────────────────────────

/// One linked device (or the main phone) under a target identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    /// Address the probe is sent to.
    pub identity: String,
    pub device_id: u32,
    pub is_main: bool,
    pub label: String,
}

impl Device {
    /// Device id 0 is the main phone; every other id is a companion.
    pub fn new(identity: impl Into<String>, device_id: u32) -> Self {
        let is_main = device_id == 0;
        let label = if is_main {
            "Phone".to_string()
        } else {
            format!("Companion {device_id}")
        };
        Self {
            identity: identity.into(),
            device_id,
            is_main,
            label,
        }
    }
}

// ── Results ───────────────────────────────────────────────────────

/// Outcome of one probe against one device.
///
/// RTTs are in milliseconds from probe creation. A missing `client_rtt`
/// means the device was considered offline for this probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    #[serde(rename = "device")]
    pub label: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub server_rtt: Option<u64>,
    pub client_rtt: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeResult {
    /// A probe that never got its action onto the network.
    pub fn failed(label: impl Into<String>, timestamp: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            timestamp,
            server_rtt: None,
            client_rtt: None,
            error: Some(error.into()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.error.is_none() && self.client_rtt.is_some()
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// All probe results of one round, in device order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundResult {
    /// 1-based round number.
    pub round: u64,
    pub started_at: DateTime<Utc>,
    pub results: Vec<ProbeResult>,
}

impl RoundResult {
    pub fn online_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_online()).count()
    }

    pub fn error_count(&self) -> usize {
        self.results.iter().filter(|r| r.error.is_some()).count()
    }

    pub fn get(&self, label: &str) -> Option<&ProbeResult> {
        self.results.iter().find(|r| r.label == label)
    }
}
