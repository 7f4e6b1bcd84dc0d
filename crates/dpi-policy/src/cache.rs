//! Verdict caches (C8): name cache, ip cache, unified gatekeeper cache,
//! and the pending-request dedup table (§4.9, SPEC_FULL §3 supplement).
//!
//! Grounded on `sase-policy::cache::PolicyCache`'s version-stamped TTL
//! pattern, but per-entry TTLs differ by policy (redirect floor vs 6h
//! non-redirect floor — §3), which moka's cache-wide `time_to_live` cannot
//! express; this module tracks `created_ts`/`ttl` per entry explicitly and
//! evicts in `periodic_cleanup`, the way the source's cache does.

use crate::rule::PolicyAction;
use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Fixed TTL floor applied to every redirect ip-cache entry (§3, §4.9).
/// The spec names this as "a fixed floor (e.g. `DNS_REDIRECT_TTL`)" without
/// pinning an exact value; 60s matches the example in scenario 3 of §8
/// being shorter than the non-redirect 6h floor while still bounding churn.
pub const DNS_REDIRECT_TTL: Duration = Duration::from_secs(60);

/// Floor applied to every non-redirect ip-cache entry (§3).
pub const NON_REDIRECT_TTL_FLOOR: Duration = Duration::from_secs(6 * 3600);

/// A device direction relative to the LAN (§3 ip-cache key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outbound,
    Inbound,
}

fn now() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// Name-cache entry (§3 `CacheEntry (name cache)`).
#[derive(Debug, Clone)]
pub struct NameCacheEntry {
    pub action: PolicyAction,
    pub ttl: Duration,
    pub created_ts: Duration,
    pub network_id: Option<String>,
    pub provider_data: Option<String>,
    pub policy_idx: Option<u32>,
}

/// Ip-cache entry (§3 `CacheEntry (ip cache)`).
#[derive(Debug, Clone)]
pub struct IpCacheEntry {
    pub action: PolicyAction,
    pub ttl: Duration,
    pub created_ts: Duration,
    /// Ground truth for "is this a redirect entry" — see §9's Open
    /// Questions: ignore `action` when deciding redirect status.
    pub redirect_flag: bool,
    pub network_id: Option<String>,
    pub service_id: Option<u16>,
    pub provider_data: Option<String>,
    pub policy_idx: Option<u32>,
}

impl IpCacheEntry {
    fn expired(&self, at: Duration) -> bool {
        at > self.created_ts + self.ttl
    }
}

impl NameCacheEntry {
    fn expired(&self, at: Duration) -> bool {
        at > self.created_ts + self.ttl
    }
}

/// Attribute kind for the unified gatekeeper cache (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Fqdn,
    Ipv4,
    Ipv6,
    Host,
    Sni,
    Url,
    App,
}

/// Gatekeeper-cache entry, same action/ttl/redirect shape as the ip cache.
#[derive(Debug, Clone)]
pub struct GatekeeperCacheEntry {
    pub action: PolicyAction,
    pub ttl: Duration,
    pub created_ts: Duration,
    pub redirect_flag: bool,
}

impl GatekeeperCacheEntry {
    fn expired(&self, at: Duration) -> bool {
        at > self.created_ts + self.ttl
    }
}

type NameKey = ([u8; 6], String);
type IpKey = ([u8; 6], IpAddr, Direction);
type GkKey = ([u8; 6], AttributeType, String);

/// The two-phase verdict cache described in §4.9: a default name+ip cache
/// plus a unified gatekeeper attribute cache.
#[derive(Default)]
pub struct VerdictCache {
    names: DashMap<NameKey, NameCacheEntry>,
    ips: DashMap<IpKey, IpCacheEntry>,
    gatekeeper: DashMap<GkKey, GatekeeperCacheEntry>,
}

impl VerdictCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_name(&self, device_mac: [u8; 6], name: String, mut entry: NameCacheEntry) {
        entry.created_ts = now();
        self.names.insert((device_mac, name), entry);
    }

    pub fn lookup_name(&self, device_mac: [u8; 6], name: &str) -> Option<NameCacheEntry> {
        let key = (device_mac, name.to_string());
        let entry = self.names.get(&key)?;
        if entry.expired(now()) {
            drop(entry);
            self.names.remove(&key);
            return None;
        }
        Some(entry.clone())
    }

    /// `add_redirect_entry` (§4.9 redirect write path): records a
    /// `redirect_flag = true` ip-cache entry with the fixed redirect TTL.
    pub fn add_redirect_entry(
        &self,
        device_mac: [u8; 6],
        ip: IpAddr,
        direction: Direction,
        service_id: Option<u16>,
    ) {
        self.ips.insert(
            (device_mac, ip, direction),
            IpCacheEntry {
                action: PolicyAction::Allow,
                ttl: DNS_REDIRECT_TTL,
                created_ts: now(),
                redirect_flag: true,
                network_id: None,
                service_id,
                provider_data: None,
                policy_idx: None,
            },
        );
    }

    /// Record a non-redirect ip-cache entry, applying the §3 6h TTL floor.
    pub fn add_ip_entry(
        &self,
        device_mac: [u8; 6],
        ip: IpAddr,
        direction: Direction,
        action: PolicyAction,
        provider_ttl: Duration,
    ) {
        let ttl = provider_ttl.max(NON_REDIRECT_TTL_FLOOR);
        self.ips.insert(
            (device_mac, ip, direction),
            IpCacheEntry {
                action,
                ttl,
                created_ts: now(),
                redirect_flag: false,
                network_id: None,
                service_id: None,
                provider_data: None,
                policy_idx: None,
            },
        );
    }

    pub fn lookup_ip(&self, device_mac: [u8; 6], ip: IpAddr, direction: Direction) -> Option<IpCacheEntry> {
        let key = (device_mac, ip, direction);
        let entry = self.ips.get(&key)?;
        if entry.expired(now()) {
            drop(entry);
            self.ips.remove(&key);
            return None;
        }
        Some(entry.clone())
    }

    /// `is_redirected_flow` (§4.9 read path): ground truth is
    /// `redirect_flag`, never the cached `action` (§9 Open Questions).
    pub fn is_redirected_flow(&self, device_mac: [u8; 6], ip: IpAddr, direction: Direction) -> bool {
        self.lookup_ip(device_mac, ip, direction).map(|e| e.redirect_flag).unwrap_or(false)
    }

    pub fn insert_gatekeeper(
        &self,
        device_mac: [u8; 6],
        attribute_type: AttributeType,
        value: String,
        entry: GatekeeperCacheEntry,
    ) {
        self.gatekeeper.insert((device_mac, attribute_type, value), entry);
    }

    pub fn lookup_gatekeeper(
        &self,
        device_mac: [u8; 6],
        attribute_type: AttributeType,
        value: &str,
    ) -> Option<GatekeeperCacheEntry> {
        let key = (device_mac, attribute_type, value.to_string());
        let entry = self.gatekeeper.get(&key)?;
        if entry.expired(now()) {
            drop(entry);
            self.gatekeeper.remove(&key);
            return None;
        }
        Some(entry.clone())
    }

    /// Remove every entry older than its TTL across all three caches.
    pub fn periodic_cleanup(&self) {
        let at = now();
        self.names.retain(|_, e| !e.expired(at));
        self.ips.retain(|_, e| !e.expired(at));
        self.gatekeeper.retain(|_, e| !e.expired(at));
    }

    /// Delete every entry written by `policy_idx` (§4.9 `flush`).
    pub fn flush_policy(&self, policy_idx: u32) {
        self.names.retain(|_, e| e.policy_idx != Some(policy_idx));
        self.ips.retain(|_, e| e.policy_idx != Some(policy_idx));
    }

    /// Delete every entry (§4.9 `flush_all_cache`).
    pub fn flush_all(&self) {
        self.names.clear();
        self.ips.clear();
        self.gatekeeper.clear();
    }
}

/// De-duplicates concurrent DNS requests for the same `(device, qname)`
/// while a gatekeeper lookup is outstanding (SPEC_FULL §3 supplement,
/// grounded on `fsm_policy.h`'s `fqdn_pending_req`). Orphaned entries are
/// retired by `periodic()` after `req_cache_ttl` (120s, §5).
#[derive(Default)]
pub struct PendingRequests {
    inflight: DashMap<NameKey, Duration>,
}

/// Default retirement window for an outstanding request (§5).
pub const REQ_CACHE_TTL: Duration = Duration::from_secs(120);

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if a request for this key was already in flight
    /// (caller should piggy-back rather than issue a new lookup).
    pub fn begin(&self, device_mac: [u8; 6], qname: &str) -> bool {
        let key = (device_mac, qname.to_string());
        let already = self.inflight.contains_key(&key);
        self.inflight.entry(key).or_insert_with(now);
        already
    }

    pub fn complete(&self, device_mac: [u8; 6], qname: &str) {
        self.inflight.remove(&(device_mac, qname.to_string()));
    }

    /// Retire requests outstanding longer than [`REQ_CACHE_TTL`].
    pub fn retire_expired(&self) -> Vec<([u8; 6], String)> {
        let at = now();
        let mut retired = Vec::new();
        self.inflight.retain(|key, started| {
            let stale = at.saturating_sub(*started) >= REQ_CACHE_TTL;
            if stale {
                retired.push(key.clone());
            }
            !stale
        });
        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_entry_uses_fixed_ttl_and_flag() {
        let cache = VerdictCache::new();
        let mac = [1, 2, 3, 4, 5, 6];
        let ip: IpAddr = "18.204.152.241".parse().unwrap();
        cache.add_redirect_entry(mac, ip, Direction::Outbound, None);

        assert!(cache.is_redirected_flow(mac, ip, Direction::Outbound));
        let entry = cache.lookup_ip(mac, ip, Direction::Outbound).unwrap();
        assert_eq!(entry.ttl, DNS_REDIRECT_TTL);
        assert!(entry.redirect_flag);
    }

    #[test]
    fn non_redirect_entry_floors_ttl_to_six_hours() {
        let cache = VerdictCache::new();
        let mac = [0; 6];
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        cache.add_ip_entry(mac, ip, Direction::Outbound, PolicyAction::Allow, Duration::from_secs(60));

        let entry = cache.lookup_ip(mac, ip, Direction::Outbound).unwrap();
        assert_eq!(entry.ttl, NON_REDIRECT_TTL_FLOOR);
        assert!(!entry.redirect_flag);
    }

    #[test]
    fn expired_entry_is_not_returned() {
        let cache = VerdictCache::new();
        let mac = [0; 6];
        cache.insert_name(
            mac,
            "example.com".to_string(),
            NameCacheEntry {
                action: PolicyAction::Allow,
                ttl: Duration::from_secs(0),
                created_ts: now() - Duration::from_secs(10),
                network_id: None,
                provider_data: None,
                policy_idx: None,
            },
        );
        assert!(cache.lookup_name(mac, "example.com").is_none());
    }

    #[test]
    fn pending_requests_dedup() {
        let pending = PendingRequests::new();
        let mac = [0; 6];
        assert!(!pending.begin(mac, "example.com"));
        assert!(pending.begin(mac, "example.com"));
        pending.complete(mac, "example.com");
        assert!(!pending.begin(mac, "example.com"));
    }
}
