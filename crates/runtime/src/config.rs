use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TERMINAL_RESYNC_SECS: u64 = 300;

/// Runtime knobs shared by all worker pools of a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Interval at which the shutdown coordinator re-checks queues and workers.
    pub drain_poll_ms: u64,
    /// Interval at which cache readiness is re-checked on startup.
    pub sync_poll_ms: u64,
    /// Re-evaluate keys that failed terminally after this long (never when unset).
    pub terminal_resync_secs: Option<u64>,
    /// Drop a key after this many consecutive retryable failures (unbounded when unset).
    pub max_retries: Option<u32>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { drain_poll_ms: 5_000, sync_poll_ms: 100, terminal_resync_secs: Some(DEFAULT_TERMINAL_RESYNC_SECS), max_retries: None }
    }
}

impl RuntimeConfig {
    pub fn drain_poll(&self) -> Duration { Duration::from_millis(self.drain_poll_ms.max(1)) }
    pub fn sync_poll(&self) -> Duration { Duration::from_millis(self.sync_poll_ms.max(1)) }
    pub fn terminal_resync(&self) -> Option<Duration> { self.terminal_resync_secs.map(Duration::from_secs) }
}

/// Number of concurrent workers per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts(BTreeMap<String, usize>);

impl WorkerCounts {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, kind: &str, workers: usize) -> Self {
        self.0.insert(kind.to_string(), workers);
        self
    }

    pub fn get(&self, kind: &str) -> usize { self.0.get(kind).copied().unwrap_or(0) }

    pub fn total(&self) -> usize { self.0.values().sum() }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> { self.0.iter().map(|(k, v)| (k.as_str(), *v)) }
}
