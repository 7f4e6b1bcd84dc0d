//! Flow accumulator store (C3, §4.3).
//!
//! Grounded on `sase-dataplane::flow::FlowTable`'s open-addressed, atomic
//! entry-state design, generalized from a fixed-size probe table to a
//! generation-counted slab: accumulators are addressed by `(slot, generation)`
//! rather than a raw pointer, per the arena-or-index guidance for the
//! plugin/accumulator back-reference cycle (§9 Design Notes).

use dashmap::DashMap;
use dpi_common::flow::{Direction, FlowKey, FlowTag};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Per-plugin per-flow decision (§3 `PerPluginFlowInfo`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginDecision {
    Clear,
    Inspect,
    Passthru,
    Drop,
}

/// Per-plugin flow info, owned by the accumulator (§3).
#[derive(Debug, Clone, Copy)]
pub struct PerPluginFlowInfo {
    pub plugin_id: u32,
    pub decision: PluginDecision,
}

/// Reportable lifecycle state of an accumulator (§3 `Accumulator.state`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccState {
    New,
    Active,
    WindowActive,
    Closed,
}

/// Opaque classifier handle hung off the accumulator (§4.2's `Stream`,
/// wrapped so dpi-dataplane need not depend on the signature engine crate).
pub type ClassifierHandle = u64;

/// Per-flow record owned by the accumulator store (§3 `Accumulator`).
pub struct Accumulator {
    pub key: FlowKey,
    pub direction: Direction,
    pub originator: FlowKey,
    pub bytes: [u64; 2],
    pub packets: [u64; 2],
    pub payload_bytes: [u64; 2],
    pub dpi_done: bool,
    pub dpi_always: bool,
    pub classifier: Option<ClassifierHandle>,
    pub plugins: Vec<PerPluginFlowInfo>,
    pub acc_ttl: Duration,
    pub created: Instant,
    pub last_hit: Instant,
    pub report: bool,
    pub flow_marker: u32,
    pub state: AccState,
    /// Vendor classification attached once the signature plugin reaches
    /// `Matched` (§4.5 step 4), carried into the C9 flow-telemetry report.
    pub report_tag: Option<FlowTag>,
}

impl Accumulator {
    fn new(key: FlowKey, acc_ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            key,
            direction: Direction::Unset,
            originator: key,
            bytes: [0, 0],
            packets: [0, 0],
            payload_bytes: [0, 0],
            dpi_done: false,
            dpi_always: false,
            classifier: None,
            plugins: Vec::new(),
            acc_ttl,
            created: now,
            last_hit: now,
            report: false,
            flow_marker: 0,
            state: AccState::New,
            report_tag: None,
        }
    }

    /// `touch` (§4.3): add counters for one direction, non-decreasing within
    /// the current window.
    pub fn touch(&mut self, dir_idx: usize, bytes: u64, payload_bytes: u64) {
        self.bytes[dir_idx] += bytes;
        self.packets[dir_idx] += 1;
        self.payload_bytes[dir_idx] += payload_bytes;
        self.last_hit = Instant::now();
    }

    pub fn plugin_info_mut(&mut self, plugin_id: u32) -> &mut PerPluginFlowInfo {
        if let Some(idx) = self.plugins.iter().position(|p| p.plugin_id == plugin_id) {
            return &mut self.plugins[idx];
        }
        self.plugins.push(PerPluginFlowInfo { plugin_id, decision: PluginDecision::Clear });
        self.plugins.last_mut().unwrap()
    }

    fn is_idle(&self, at: Instant) -> bool {
        at.duration_since(self.last_hit) > self.acc_ttl
    }
}

/// Generational slot so plugins can hold `(index, generation)` handles
/// instead of raw references into the slab (§9 Design Notes).
struct Slot {
    generation: u64,
    acc: Option<Accumulator>,
}

/// A `(slot index, generation)` handle. Stale handles (generation mismatch
/// after the slot was reused) resolve to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccHandle {
    pub index: u32,
    pub generation: u64,
}

impl AccHandle {
    /// Pack into the opaque `u64` carried by `dpi_policy::PolicyRequest`.
    pub fn pack(self) -> u64 {
        (self.generation << 32) | self.index as u64
    }

    pub fn unpack(value: u64) -> Self {
        Self { index: (value & 0xFFFF_FFFF) as u32, generation: value >> 32 }
    }
}

/// Flow accumulator store (C3). Owns every live `Accumulator`, keyed by
/// 5-tuple with a reverse-direction alias so either leg of a flow resolves
/// to the same record (§3: "a flow exists at most once per key").
pub struct AccumulatorStore {
    slab: RwLock<Vec<Slot>>,
    free: RwLock<Vec<u32>>,
    index: DashMap<FlowKey, u32>,
    active_accs: AtomicU64,
    default_ttl: Duration,
}

impl AccumulatorStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            slab: RwLock::new(Vec::new()),
            free: RwLock::new(Vec::new()),
            index: DashMap::new(),
            active_accs: AtomicU64::new(0),
            default_ttl,
        }
    }

    /// `lookup(key)` (§4.3): resolves either direction of an existing flow.
    pub fn lookup(&self, key: &FlowKey) -> Option<AccHandle> {
        let idx = *self.index.get(key).or_else(|| self.index.get(&key.reverse()))?;
        let slab = self.slab.read();
        let slot = slab.get(idx as usize)?;
        slot.acc.as_ref()?;
        Some(AccHandle { index: idx, generation: slot.generation })
    }

    /// `insert(key, initial_counters)` (§4.3): creates a new accumulator if
    /// `key` is unseen, otherwise returns the existing handle.
    pub fn insert(&self, key: FlowKey) -> AccHandle {
        if let Some(handle) = self.lookup(&key) {
            return handle;
        }

        let acc = Accumulator::new(key, self.default_ttl);
        let mut slab = self.slab.write();
        let index = if let Some(idx) = self.free.write().pop() {
            let slot = &mut slab[idx as usize];
            slot.generation += 1;
            slot.acc = Some(acc);
            idx
        } else {
            let idx = slab.len() as u32;
            slab.push(Slot { generation: 0, acc: Some(acc) });
            idx
        };
        let generation = slab[index as usize].generation;
        drop(slab);

        self.index.insert(key, index);
        self.active_accs.fetch_add(1, Ordering::Relaxed);
        AccHandle { index, generation }
    }

    /// Run `f` against the live accumulator behind `handle`, if still valid.
    pub fn with_mut<R>(&self, handle: AccHandle, f: impl FnOnce(&mut Accumulator) -> R) -> Option<R> {
        let mut slab = self.slab.write();
        let slot = slab.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.acc.as_mut().map(f)
    }

    pub fn with<R>(&self, handle: AccHandle, f: impl FnOnce(&Accumulator) -> R) -> Option<R> {
        let slab = self.slab.read();
        let slot = slab.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.acc.as_ref().map(f)
    }

    /// `mark_windowed(acc)` (§4.3): resets reportable counters at a window
    /// boundary without tearing down the underlying stream.
    pub fn mark_windowed(&self, handle: AccHandle) {
        self.with_mut(handle, |acc| {
            acc.state = AccState::WindowActive;
            acc.report = false;
        });
    }

    /// `close_window()` (§4.3): flips every `WindowActive` accumulator back
    /// to `Active`, called by the periodic report tick (C9).
    pub fn close_window(&self) {
        for slot in self.slab.write().iter_mut() {
            if let Some(acc) = slot.acc.as_mut() {
                if acc.state == AccState::WindowActive {
                    acc.state = AccState::Active;
                }
            }
        }
    }

    /// `free_inactive(now)` (§4.3): tears down idle accumulators, invoking
    /// `on_free` for each (plugin free-flow-info hook, then classifier
    /// connection free, then the accumulator itself — §3 destruction order).
    pub fn free_inactive(&self, now: Instant, mut on_free: impl FnMut(&Accumulator)) {
        let mut freed_keys = Vec::new();
        {
            let mut slab = self.slab.write();
            for (idx, slot) in slab.iter_mut().enumerate() {
                let expired = slot.acc.as_ref().map(|acc| acc.is_idle(now)).unwrap_or(false);
                if expired {
                    if let Some(acc) = slot.acc.take() {
                        on_free(&acc);
                        freed_keys.push(acc.key);
                        self.free.write().push(idx as u32);
                        self.active_accs.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            }
        }
        for key in freed_keys {
            self.index.remove(&key);
        }
    }

    pub fn active_accs(&self) -> u64 {
        self.active_accs.load(Ordering::Relaxed)
    }

    /// Collect `(device_mac, tag)` for every reportable accumulator — the
    /// `report` flag set and a vendor tag attached (§4.10 "flow telemetry").
    pub fn reportable_flows(&self) -> Vec<([u8; 6], FlowTag)> {
        self.slab
            .read()
            .iter()
            .filter_map(|slot| slot.acc.as_ref())
            .filter(|acc| acc.report)
            .filter_map(|acc| acc.report_tag.clone().map(|tag| (acc.key.smac, tag)))
            .collect()
    }
}

/// Helper retained for attribute plugins that need a plain map from
/// `(plugin_id)` to a name for logging; not part of the store's hot path.
pub type PluginNameTable = HashMap<u32, &'static str>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn key(sport: u16) -> FlowKey {
        FlowKey {
            smac: [1; 6],
            dmac: [2; 6],
            vlan: 0,
            ethertype: 0x0800,
            ip_version: dpi_common::flow::IpVersion::V4,
            protocol: 6,
            sip: "10.0.0.1".parse::<IpAddr>().unwrap(),
            dip: "10.0.0.2".parse::<IpAddr>().unwrap(),
            sport,
            dport: 443,
            icmp_id: None,
        }
    }

    #[test]
    fn insert_then_lookup_same_key() {
        let store = AccumulatorStore::new(Duration::from_secs(60));
        let h1 = store.insert(key(1));
        let h2 = store.lookup(&key(1)).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.active_accs(), 1);
    }

    #[test]
    fn lookup_resolves_reverse_direction() {
        let store = AccumulatorStore::new(Duration::from_secs(60));
        let fwd = key(1);
        let h1 = store.insert(fwd);
        let h2 = store.lookup(&fwd.reverse()).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn stale_handle_after_free_returns_none() {
        let store = AccumulatorStore::new(Duration::from_secs(0));
        let handle = store.insert(key(1));
        store.free_inactive(Instant::now() + Duration::from_secs(1), |_| {});
        assert!(store.with(handle, |_| ()).is_none());

        let new_handle = store.insert(key(2));
        assert_ne!(new_handle.generation, handle.generation.wrapping_sub(1));
    }
}
