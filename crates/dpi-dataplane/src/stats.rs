//! Dispatcher/accumulator statistics (grounded on `sase-dataplane::stats::CoreStats`'
//! atomic-counter + snapshot shape, relabeled for the fields this data plane
//! actually tracks: `active_accs` (§4.3) and per-verdict dispatch counters
//! instead of RX/TX byte counters, since that ambient throughput metric
//! belongs to the ingress transport, not the dispatcher).

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free dispatcher counters.
#[repr(C, align(64))]
pub struct DispatchStats {
    pub packets_seen: AtomicU64,
    pub flows_created: AtomicU64,
    pub flows_freed: AtomicU64,
    pub dropped: AtomicU64,
    pub passthru: AtomicU64,
    pub inspected: AtomicU64,
    pub fragments_bypassed: AtomicU64,
}

impl Default for DispatchStats {
    fn default() -> Self {
        Self {
            packets_seen: AtomicU64::new(0),
            flows_created: AtomicU64::new(0),
            flows_freed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            passthru: AtomicU64::new(0),
            inspected: AtomicU64::new(0),
            fragments_bypassed: AtomicU64::new(0),
        }
    }
}

impl DispatchStats {
    #[inline(always)]
    pub fn record_packet(&self) {
        self.packets_seen.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_flow_created(&self) {
        self.flows_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_flow_freed(&self) {
        self.flows_freed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_verdict(&self, verdict: crate::dispatch::Verdict) {
        match verdict {
            crate::dispatch::Verdict::Drop => self.dropped.fetch_add(1, Ordering::Relaxed),
            crate::dispatch::Verdict::Passthru => self.passthru.fetch_add(1, Ordering::Relaxed),
            crate::dispatch::Verdict::Inspect => self.inspected.fetch_add(1, Ordering::Relaxed),
        };
    }

    #[inline(always)]
    pub fn record_fragment_bypass(&self) {
        self.fragments_bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            packets_seen: self.packets_seen.load(Ordering::Relaxed),
            flows_created: self.flows_created.load(Ordering::Relaxed),
            flows_freed: self.flows_freed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            passthru: self.passthru.load(Ordering::Relaxed),
            inspected: self.inspected.load(Ordering::Relaxed),
            fragments_bypassed: self.fragments_bypassed.load(Ordering::Relaxed),
        }
    }
}

/// Non-atomic point-in-time copy, suitable for the C9 flow-telemetry report.
#[derive(Debug, Clone, Default)]
pub struct DispatchStatsSnapshot {
    pub packets_seen: u64,
    pub flows_created: u64,
    pub flows_freed: u64,
    pub dropped: u64,
    pub passthru: u64,
    pub inspected: u64,
    pub fragments_bypassed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate() {
        let stats = DispatchStats::default();
        stats.record_packet();
        stats.record_flow_created();
        stats.record_verdict(crate::dispatch::Verdict::Drop);

        let snap = stats.snapshot();
        assert_eq!(snap.packets_seen, 1);
        assert_eq!(snap.flows_created, 1);
        assert_eq!(snap.dropped, 1);
    }
}
