//! Telemetry facade for the privacy engine. Counters, gauges and latency
//! samples are kept in process so tests can assert instrumentation and the
//! service layer can ship snapshots to whatever exporter it runs.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};
use thiserror::Error;

const DEFAULT_FLUSH_MS: u64 = 5_000;
/// Per-metric sample cap between flushes; the oldest samples go first.
pub const MAX_LATENCY_SAMPLES: usize = 1_024;

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_MS
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryConfig {
    /// Collector endpoint handed to the exporter owned by the service layer.
    pub endpoint: String,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Labels attached to every snapshot.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::sample("http://localhost:4318")
    }
}

impl TelemetryConfig {
    pub fn sample(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_owned(),
            flush_interval_ms: default_flush_interval_ms(),
            labels: BTreeMap::from([("component".into(), "privacy-engine".into())]),
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("counter overflow for metric {0}")]
    CounterOverflow(String),
    #[error("gauge {name} rejected non-finite value {value}")]
    NonFiniteGauge { name: String, value: f64 },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub timestamp: SystemTime,
    pub labels: BTreeMap<String, String>,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub latencies_ms: BTreeMap<String, Vec<u64>>,
}

struct TelemetryState {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    latencies_ms: BTreeMap<String, VecDeque<u64>>,
    last_flush: Instant,
}

impl TelemetryState {
    fn new() -> Self {
        Self {
            counters: BTreeMap::new(),
            gauges: BTreeMap::new(),
            latencies_ms: BTreeMap::new(),
            last_flush: Instant::now(),
        }
    }
}

/// Cheap to clone; every clone records into the same state.
#[derive(Clone)]
pub struct TelemetryHandle {
    config: TelemetryConfig,
    state: Arc<Mutex<TelemetryState>>,
}

impl TelemetryHandle {
    pub fn from_config(config: TelemetryConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(TelemetryState::new())),
        }
    }

    pub fn record_counter(&self, name: &str, delta: u64) -> Result<(), TelemetryError> {
        let mut guard = self.state.lock();
        let entry = guard.counters.entry(name.to_owned()).or_default();
        *entry = entry
            .checked_add(delta)
            .ok_or_else(|| TelemetryError::CounterOverflow(name.to_owned()))?;
        Ok(())
    }

    pub fn record_latency_ms(&self, name: &str, value: u64) {
        let mut guard = self.state.lock();
        let samples = guard.latencies_ms.entry(name.to_owned()).or_default();
        if samples.len() == MAX_LATENCY_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(value);
    }

    /// Gauges keep the last value written; flushing does not reset them.
    pub fn set_gauge(&self, name: &str, value: f64) -> Result<(), TelemetryError> {
        if !value.is_finite() {
            return Err(TelemetryError::NonFiniteGauge {
                name: name.to_owned(),
                value,
            });
        }
        self.state.lock().gauges.insert(name.to_owned(), value);
        Ok(())
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.state.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.state.lock().gauges.get(name).copied()
    }

    /// Drains counters and latency samples into a snapshot.
    pub fn flush(&self) -> TelemetrySnapshot {
        self.drain(&mut self.state.lock())
    }

    /// Flushes only once `flush_interval_ms` has passed since the last flush.
    pub fn flush_due(&self) -> Option<TelemetrySnapshot> {
        let mut guard = self.state.lock();
        let interval = Duration::from_millis(self.config.flush_interval_ms);
        (guard.last_flush.elapsed() >= interval).then(|| self.drain(&mut guard))
    }

    fn drain(&self, state: &mut TelemetryState) -> TelemetrySnapshot {
        state.last_flush = Instant::now();
        TelemetrySnapshot {
            timestamp: SystemTime::now(),
            labels: self.config.labels.clone(),
            counters: std::mem::take(&mut state.counters),
            gauges: state.gauges.clone(),
            latencies_ms: std::mem::take(&mut state.latencies_ms)
                .into_iter()
                .map(|(name, samples)| (name, samples.into()))
                .collect(),
        }
    }
}

impl std::fmt::Debug for TelemetryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryHandle")
            .field("endpoint", &self.config.endpoint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn handle() -> TelemetryHandle {
        TelemetryHandle::from_config(TelemetryConfig::sample("http://localhost:4318"))
    }

    #[test]
    fn records_counters_gauges_and_latencies() {
        let handle = handle();
        handle.record_counter("decision.accepted", 1).unwrap();
        handle.record_counter("decision.accepted", 2).unwrap();
        handle.set_gauge("budget.patients_v1.epsilon_remaining", 0.6).unwrap();
        handle.record_latency_ms("stage.source", 42);
        let snapshot = handle.flush();
        assert_eq!(snapshot.counters["decision.accepted"], 3);
        assert_eq!(snapshot.gauges["budget.patients_v1.epsilon_remaining"], 0.6);
        assert_eq!(snapshot.latencies_ms["stage.source"], vec![42]);
        assert_eq!(snapshot.labels["component"], "privacy-engine");
    }

    #[test]
    fn detects_counter_overflow() {
        let handle = handle();
        handle.record_counter("decision.accepted", u64::MAX).unwrap();
        let err = handle.record_counter("decision.accepted", 1).unwrap_err();
        assert!(matches!(err, TelemetryError::CounterOverflow(_)));
    }

    #[test]
    fn rejects_non_finite_gauges() {
        let err = handle().set_gauge("budget.x", f64::NAN).unwrap_err();
        assert!(matches!(err, TelemetryError::NonFiniteGauge { .. }));
    }

    #[test]
    fn flush_drains_counters_but_keeps_gauges() {
        let handle = handle();
        handle.record_counter("decision.rejected", 1).unwrap();
        handle.set_gauge("budget.x", 1.5).unwrap();
        handle.flush();
        let second = handle.flush();
        assert!(second.counters.is_empty());
        assert_eq!(second.gauges["budget.x"], 1.5);
    }

    #[test]
    fn latency_samples_are_capped_per_metric() {
        let handle = handle();
        for value in 0..(MAX_LATENCY_SAMPLES as u64 + 10) {
            handle.record_latency_ms("evaluate", value);
        }
        let samples = &handle.flush().latencies_ms["evaluate"];
        assert_eq!(samples.len(), MAX_LATENCY_SAMPLES);
        assert_eq!(samples[0], 10);
    }

    #[test]
    fn flush_due_waits_for_the_interval() {
        let mut config = TelemetryConfig::sample("http://localhost:4318");
        config.flush_interval_ms = 60_000;
        let slow = TelemetryHandle::from_config(config.clone());
        slow.record_counter("decision.accepted", 1).unwrap();
        assert!(slow.flush_due().is_none());
        assert_eq!(slow.counter("decision.accepted"), 1);

        config.flush_interval_ms = 0;
        let eager = TelemetryHandle::from_config(config);
        eager.record_counter("decision.accepted", 1).unwrap();
        assert_eq!(eager.flush_due().unwrap().counters["decision.accepted"], 1);
        assert_eq!(eager.counter("decision.accepted"), 0);
    }
}
