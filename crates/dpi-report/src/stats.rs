//! DPI-health counters (§4.10): per-engine counters plus per-flow tag data
//! for every reportable accumulator seen within the reporting window.

use crate::FlowReport;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-engine counters carried in every periodic DPI-health report.
#[derive(Debug, Default)]
pub struct HealthStats {
    pub current_allocations: AtomicU64,
    pub peak_allocations: AtomicU64,
    pub failed_allocations: AtomicU64,
    pub scanned_bytes: AtomicU64,
    pub scans_started: AtomicU64,
    pub scans_stopped: AtomicU64,
    pub connections: AtomicU64,
    pub streams: AtomicU64,
    pub errors: AtomicU64,
}

impl HealthStats {
    pub fn snapshot(&self) -> HealthStatsSnapshot {
        HealthStatsSnapshot {
            current_allocations: self.current_allocations.load(Ordering::Relaxed),
            peak_allocations: self.peak_allocations.load(Ordering::Relaxed),
            failed_allocations: self.failed_allocations.load(Ordering::Relaxed),
            scanned_bytes: self.scanned_bytes.load(Ordering::Relaxed),
            scans_started: self.scans_started.load(Ordering::Relaxed),
            scans_stopped: self.scans_stopped.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            streams: self.streams.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn record_alloc(&self) {
        let current = self.current_allocations.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_allocations.fetch_max(current, Ordering::Relaxed);
    }

    pub fn record_free(&self) {
        self.current_allocations.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthStatsSnapshot {
    pub current_allocations: u64,
    pub peak_allocations: u64,
    pub failed_allocations: u64,
    pub scanned_bytes: u64,
    pub scans_started: u64,
    pub scans_stopped: u64,
    pub connections: u64,
    pub streams: u64,
    pub errors: u64,
}

/// The full periodic DPI-health payload (§4.10): engine counters plus the
/// reportable accumulators seen since the last tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlowTelemetry {
    pub stats: HealthStatsSnapshot,
    pub flows: Vec<FlowReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_tracks_high_water_mark() {
        let stats = HealthStats::default();
        stats.record_alloc();
        stats.record_alloc();
        stats.record_free();
        let snap = stats.snapshot();
        assert_eq!(snap.current_allocations, 1);
        assert_eq!(snap.peak_allocations, 2);
    }
}
