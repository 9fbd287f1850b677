//! Congestion sampling: turns raw store counters into a classified snapshot.
//!
//! A [`CongestionSnapshot`] is a plain value computed eagerly from one
//! `server_status` round trip. Counters the store does not report read as 0 %
//! utilization and are listed in `missing`, so admission always has an input.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use crate::store::{DocumentStore, EvictionThresholds, RawCounters};

/// Utilization class of one resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UtilizationStatus {
    Low,
    Medium,
    High,
}

/// Two-level classification bounds: `value < target` is low,
/// `value < trigger` is medium, anything else is high.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Thresholds {
    pub target: f64,
    pub trigger: f64,
}

impl Thresholds {
    pub const fn new(target: f64, trigger: f64) -> Self {
        Self { target, trigger }
    }

    pub fn classify(&self, value: f64) -> UtilizationStatus {
        if value < self.target {
            UtilizationStatus::Low
        } else if value < self.trigger {
            UtilizationStatus::Medium
        } else {
            UtilizationStatus::High
        }
    }
}

/// Classification bounds for every sampled resource.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TelemetryThresholds {
    pub cache: Thresholds,
    pub dirty: Thresholds,
    pub updates: Thresholds,
    pub tickets: Thresholds,
    pub checkpoint: Thresholds,
    /// Seconds of replication lag.
    pub replication_lag_secs: Thresholds,
    pub fragmentation: Thresholds,
}

impl Default for TelemetryThresholds {
    fn default() -> Self {
        Self {
            cache: Thresholds::new(80.0, 95.0),
            dirty: Thresholds::new(5.0, 20.0),
            updates: Thresholds::new(2.5, 10.0),
            tickets: Thresholds::new(75.0, 90.0),
            checkpoint: Thresholds::new(50.0, 80.0),
            replication_lag_secs: Thresholds::new(10.0, 60.0),
            fragmentation: Thresholds::new(25.0, 50.0),
        }
    }
}

impl TelemetryThresholds {
    /// Replace the cache bounds with the store's own eviction settings.
    pub fn with_eviction(mut self, eviction: &EvictionThresholds) -> Self {
        self.cache = Thresholds::new(eviction.target_pct, eviction.trigger_pct);
        self.dirty = Thresholds::new(eviction.dirty_target_pct, eviction.dirty_trigger_pct);
        self.updates = Thresholds::new(eviction.updates_target_pct, eviction.updates_trigger_pct);
        self
    }
}

/// A measured value and its class.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ResourceReading {
    pub value: f64,
    pub status: UtilizationStatus,
}

impl ResourceReading {
    fn classify(value: f64, thresholds: &Thresholds) -> Self {
        Self {
            value,
            status: thresholds.classify(value),
        }
    }
}

/// Point-in-time resource utilization of the store.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CongestionSnapshot {
    /// Cache bytes in use as a percent of the configured maximum.
    pub cache: ResourceReading,
    /// Tracked dirty bytes as a percent of the cache maximum.
    pub dirty: ResourceReading,
    /// Bytes held for updates as a percent of the cache maximum.
    pub updates: ResourceReading,
    pub read_tickets: ResourceReading,
    pub write_tickets: ResourceReading,
    /// Checkpoint running time as a percent of the checkpoint interval.
    pub checkpoint: ResourceReading,
    pub replication_lag: Option<ResourceReading>,
    pub heap_fragmentation: Option<ResourceReading>,
    /// Counters that were absent and read as zero.
    pub missing: Vec<&'static str>,
}

fn percent(
    name: &'static str,
    num: Option<u64>,
    den: Option<u64>,
    missing: &mut Vec<&'static str>,
) -> f64 {
    match (num, den) {
        (Some(num), Some(den)) if den > 0 => num as f64 / den as f64 * 100.0,
        _ => {
            missing.push(name);
            0.0
        }
    }
}

impl CongestionSnapshot {
    /// Classify raw counters. Store-reported eviction thresholds take
    /// precedence over `defaults` for cache, dirty and updates.
    pub fn from_counters(counters: &RawCounters, defaults: &TelemetryThresholds) -> Self {
        let thresholds = match &counters.eviction {
            Some(eviction) => defaults.with_eviction(eviction),
            None => *defaults,
        };
        let mut missing = Vec::new();
        let cache = percent(
            "cache_bytes_in_use",
            counters.cache_bytes_in_use,
            counters.cache_bytes_max,
            &mut missing,
        );
        let dirty = percent(
            "cache_dirty_bytes",
            counters.cache_dirty_bytes,
            counters.cache_bytes_max,
            &mut missing,
        );
        let updates = percent(
            "cache_update_bytes",
            counters.cache_update_bytes,
            counters.cache_bytes_max,
            &mut missing,
        );
        let read_tickets = percent(
            "read_tickets",
            counters.read_tickets_out,
            counters.read_tickets_total,
            &mut missing,
        );
        let write_tickets = percent(
            "write_tickets",
            counters.write_tickets_out,
            counters.write_tickets_total,
            &mut missing,
        );
        let checkpoint = percent(
            "checkpoint",
            counters.checkpoint_running_ms,
            counters.checkpoint_interval_ms,
            &mut missing,
        );

        let replication_lag = counters.replication_lag_ms.map(|lag_ms| {
            ResourceReading::classify(lag_ms as f64 / 1000.0, &thresholds.replication_lag_secs)
        });
        let heap_fragmentation = match (counters.heap_fragmented_bytes, counters.heap_allocated_bytes)
        {
            (Some(fragmented), Some(allocated)) if allocated > 0 => Some(ResourceReading::classify(
                fragmented as f64 / allocated as f64 * 100.0,
                &thresholds.fragmentation,
            )),
            _ => None,
        };

        Self {
            cache: ResourceReading::classify(cache, &thresholds.cache),
            dirty: ResourceReading::classify(dirty, &thresholds.dirty),
            updates: ResourceReading::classify(updates, &thresholds.updates),
            read_tickets: ResourceReading::classify(read_tickets, &thresholds.tickets),
            write_tickets: ResourceReading::classify(write_tickets, &thresholds.tickets),
            checkpoint: ResourceReading::classify(checkpoint, &thresholds.checkpoint),
            replication_lag,
            heap_fragmentation,
            missing,
        }
    }
}

/// Pulls a fresh [`CongestionSnapshot`] from the store on every call.
#[derive(Clone)]
pub struct TelemetrySampler {
    store: Arc<dyn DocumentStore>,
    defaults: TelemetryThresholds,
}

impl TelemetrySampler {
    pub fn new(store: Arc<dyn DocumentStore>, defaults: TelemetryThresholds) -> Self {
        Self { store, defaults }
    }

    /// Sample the store once.
    ///
    /// An unsupported or unauthorized status command degrades to an all-zero
    /// snapshot; any other failure is returned.
    pub async fn sample(&self) -> anyhow::Result<CongestionSnapshot> {
        let counters = match self.store.server_status().await {
            Ok(counters) => counters,
            Err(err) if err.is_unavailable() => {
                tracing::debug!(error = %err, "server status unavailable; using default counters");
                RawCounters::default()
            }
            Err(err) => return Err(err).context("sample store resource counters"),
        };
        let snapshot = CongestionSnapshot::from_counters(&counters, &self.defaults);
        if !snapshot.missing.is_empty() {
            tracing::trace!(missing = ?snapshot.missing, "telemetry counters defaulted");
        }
        Ok(snapshot)
    }
}
