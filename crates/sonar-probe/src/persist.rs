//! Result sinks: where finished rounds go.

use std::fs;
use std::path::{Path, PathBuf};

use sonar_core::{ProbeResult, RoundResult};

use crate::error::Result;

/// Receives every completed round, in order.
pub trait ResultSink {
    fn record(&mut self, round: &RoundResult) -> Result<()>;
}

impl<S: ResultSink + ?Sized> ResultSink for &mut S {
    fn record(&mut self, round: &RoundResult) -> Result<()> {
        (**self).record(round)
    }
}

impl<S: ResultSink> ResultSink for Option<S> {
    fn record(&mut self, round: &RoundResult) -> Result<()> {
        match self {
            Some(sink) => sink.record(round),
            None => Ok(()),
        }
    }
}

impl<A: ResultSink, B: ResultSink> ResultSink for (A, B) {
    fn record(&mut self, round: &RoundResult) -> Result<()> {
        self.0.record(round)?;
        self.1.record(round)
    }
}

/// Keeps rounds in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    rounds: Vec<RoundResult>,
}

impl MemorySink {
    pub fn rounds(&self) -> &[RoundResult] {
        &self.rounds
    }
}

impl ResultSink for MemorySink {
    fn record(&mut self, round: &RoundResult) -> Result<()> {
        self.rounds.push(round.clone());
        Ok(())
    }
}

/// Writes `online-rtt-{target}.json` in `dir`: a JSON array of every probe
/// result of this invocation, rewritten in full after each round.
pub struct JsonFileSink {
    path: PathBuf,
    history: Vec<ProbeResult>,
}

impl JsonFileSink {
    pub fn new(dir: impl AsRef<Path>, target: &str) -> Self {
        let file_name = format!("online-rtt-{}.json", file_safe(target));
        Self {
            path: dir.as_ref().join(file_name),
            history: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&self.history)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

impl ResultSink for JsonFileSink {
    fn record(&mut self, round: &RoundResult) -> Result<()> {
        self.history.extend(round.results.iter().cloned());
        self.flush()?;
        tracing::debug!(
            path = %self.path.display(),
            results = self.history.len(),
            "Results saved"
        );
        Ok(())
    }
}

fn file_safe(target: &str) -> String {
    target
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn round(n: u64, client_rtt: Option<u64>) -> RoundResult {
        let now = Utc::now();
        RoundResult {
            round: n,
            started_at: now,
            results: vec![ProbeResult {
                label: "Phone".to_string(),
                timestamp: now,
                server_rtt: Some(120),
                client_rtt,
                error: None,
            }],
        }
    }

    #[test]
    fn file_sink_rewrites_full_history() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("results");
        let mut sink = JsonFileSink::new(&out, "4915112345678");

        sink.record(&round(1, Some(340))).unwrap();
        sink.record(&round(2, None)).unwrap();

        assert_eq!(sink.path(), out.join("online-rtt-4915112345678.json"));
        let saved: Vec<serde_json::Value> =
            serde_json::from_str(&fs::read_to_string(sink.path()).unwrap()).unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0]["clientRtt"], 340);
        assert!(saved[1]["clientRtt"].is_null());
        assert_eq!(saved[1]["serverRtt"], 120);
        assert!(saved[0]["timestamp"].is_i64());
    }

    #[test]
    fn file_names_are_sanitized() {
        let sink = JsonFileSink::new("/tmp", "123@s.whatsapp.net");
        assert_eq!(
            sink.path().file_name().unwrap(),
            "online-rtt-123_s_whatsapp_net.json"
        );
    }

    #[test]
    fn composite_sinks_record_everything() {
        let mut sinks = (MemorySink::default(), Some(MemorySink::default()));
        sinks.record(&round(1, Some(1))).unwrap();
        sinks.record(&round(2, Some(2))).unwrap();

        assert_eq!(sinks.0.rounds().len(), 2);
        assert_eq!(sinks.1.as_ref().unwrap().rounds().len(), 2);

        let mut none: Option<MemorySink> = None;
        none.record(&round(3, None)).unwrap();
    }
}
