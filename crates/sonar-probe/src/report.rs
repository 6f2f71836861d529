//! Human-readable round output and end-of-run summary.

use std::fmt::Write as _;

use sonar_core::{ProbeResult, RoundResult};

use crate::error::Result;
use crate::persist::ResultSink;

const LABEL_WIDTH: usize = 15;

/// One status word per probe result.
pub fn describe(result: &ProbeResult) -> String {
    if let Some(error) = &result.error {
        return format!("Error - {error}");
    }
    match result.client_rtt {
        Some(rtt) => format!("ONLINE ({rtt}ms)"),
        None => "OFFLINE (-)".to_string(),
    }
}

pub fn format_round(round: &RoundResult) -> String {
    let mut out = format!("[Probe {}]", round.round);
    for result in &round.results {
        let _ = write!(
            out,
            "\n  {:<width$}: {}",
            result.label,
            describe(result),
            width = LABEL_WIDTH
        );
    }
    out
}

/// Per-device totals across a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub label: String,
    pub probes: usize,
    pub online: usize,
    pub errors: usize,
    pub median_client_rtt: Option<u64>,
}

/// Summarize rounds per device, in order of first appearance.
pub fn summarize(rounds: &[RoundResult]) -> Vec<DeviceSummary> {
    let mut labels: Vec<&str> = Vec::new();
    for result in rounds.iter().flat_map(|r| &r.results) {
        if !labels.contains(&result.label.as_str()) {
            labels.push(&result.label);
        }
    }

    labels
        .into_iter()
        .map(|label| {
            let results: Vec<&ProbeResult> = rounds
                .iter()
                .flat_map(|r| &r.results)
                .filter(|r| r.label == label)
                .collect();
            let mut rtts: Vec<u64> = results.iter().filter_map(|r| r.client_rtt).collect();
            rtts.sort_unstable();

            DeviceSummary {
                label: label.to_string(),
                probes: results.len(),
                online: results.iter().filter(|r| r.is_online()).count(),
                errors: results.iter().filter(|r| r.error.is_some()).count(),
                median_client_rtt: median(&rtts),
            }
        })
        .collect()
}

fn median(sorted: &[u64]) -> Option<u64> {
    let mid = sorted.len() / 2;
    match sorted.len() {
        0 => None,
        n if n % 2 == 1 => Some(sorted[mid]),
        _ => Some((sorted[mid - 1] + sorted[mid]) / 2),
    }
}

pub fn format_summary(summary: &[DeviceSummary]) -> String {
    let mut out = String::from("Summary");
    for device in summary {
        let median = device
            .median_client_rtt
            .map_or_else(|| "-".to_string(), |rtt| format!("{rtt}ms"));
        let _ = write!(
            out,
            "\n  {:<width$}: online {}/{} (median {median}){}",
            device.label,
            device.online,
            device.probes,
            if device.errors > 0 {
                format!(", {} error(s)", device.errors)
            } else {
                String::new()
            },
            width = LABEL_WIDTH
        );
    }
    out
}

/// Prints each round to stdout and remembers it for the summary.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    rounds: Vec<RoundResult>,
}

impl ConsoleSink {
    pub fn rounds(&self) -> &[RoundResult] {
        &self.rounds
    }
}

impl ResultSink for ConsoleSink {
    fn record(&mut self, round: &RoundResult) -> Result<()> {
        println!("{}", format_round(round));
        self.rounds.push(round.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(label: &str, client_rtt: Option<u64>) -> ProbeResult {
        ProbeResult {
            label: label.to_string(),
            timestamp: Utc::now(),
            server_rtt: Some(100),
            client_rtt,
            error: None,
        }
    }

    fn round(n: u64, results: Vec<ProbeResult>) -> RoundResult {
        RoundResult {
            round: n,
            started_at: Utc::now(),
            results,
        }
    }

    #[test]
    fn formats_each_outcome() {
        let r = round(
            2,
            vec![
                result("Phone", Some(340)),
                result("Companion 1", None),
                ProbeResult::failed("Companion 2", Utc::now(), "Send failed: boom"),
            ],
        );
        let text = format_round(&r);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "[Probe 2]");
        assert_eq!(lines[1], "  Phone          : ONLINE (340ms)");
        assert_eq!(lines[2], "  Companion 1    : OFFLINE (-)");
        assert_eq!(lines[3], "  Companion 2    : Error - Send failed: boom");
    }

    #[test]
    fn summary_medians_per_device() {
        let rounds = vec![
            round(1, vec![result("Phone", Some(300)), result("Companion 1", None)]),
            round(2, vec![result("Phone", Some(500)), result("Companion 1", None)]),
            round(3, vec![result("Phone", None), result("Companion 1", Some(90))]),
        ];

        let summary = summarize(&rounds);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].label, "Phone");
        assert_eq!(summary[0].probes, 3);
        assert_eq!(summary[0].online, 2);
        assert_eq!(summary[0].median_client_rtt, Some(400));
        assert_eq!(summary[1].median_client_rtt, Some(90));

        let text = format_summary(&summary);
        assert!(text.contains("online 2/3 (median 400ms)"));
    }

    #[test]
    fn median_of_nothing() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[7]), Some(7));
        assert_eq!(median(&[1, 2, 9]), Some(2));
    }
}
