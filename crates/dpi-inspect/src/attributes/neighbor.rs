//! ARP/NDP neighbor learner (§4.6). Writes `(ip, mac, direction)` into a
//! TTL-bounded neighbor table, skipping broadcast/multicast and
//! all-zero addresses.
//!
//! `NetHeader::parse` only recognizes the IPv4/IPv6 ethertypes (C1), so an
//! ARP frame (ethertype 0x0806) never reaches the dispatcher as a
//! `NetHeader` through the normal path — the ARP side of this plugin is
//! reachable only from an ingress adapter that special-cases that
//! ethertype and calls `learn_arp` directly. NDP, carried inside ICMPv6,
//! goes through the ordinary `on_packet` path.

use dpi_common::flow::Direction;
use dpi_common::header::NetHeader;
use dpi_dataplane::{AccHandle, AccumulatorStore, DpiPlugin, PluginDecision};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const NEIGHBOR_PLUGIN_ID: u32 = 500;

const BROADCAST_MAC: [u8; 6] = [0xff; 6];
const ZERO_MAC: [u8; 6] = [0; 6];

fn is_usable_mac(mac: [u8; 6]) -> bool {
    mac != BROADCAST_MAC && mac != ZERO_MAC && mac[0] & 0x01 == 0
}

struct Entry {
    mac: [u8; 6],
    direction: Direction,
    expires: Instant,
}

pub struct NeighborPlugin {
    table: Mutex<std::collections::HashMap<IpAddr, Entry>>,
    ttl: Duration,
}

impl NeighborPlugin {
    pub fn new(ttl: Duration) -> Self {
        Self { table: Mutex::new(std::collections::HashMap::new()), ttl }
    }

    /// Feed an ARP request/reply learned by an ingress adapter (see module
    /// doc) into the neighbor table.
    pub fn learn_arp(&self, payload: &[u8]) {
        if let Some((op, sha, spa, tha, tpa)) = Self::parse_arp(payload) {
            match op {
                1 => self.learn(spa, sha, Direction::Outbound),
                2 => {
                    self.learn(spa, sha, Direction::Inbound);
                    if tha != ZERO_MAC {
                        self.learn(tpa, tha, Direction::Outbound);
                    }
                }
                _ => {}
            }
        }
    }

    fn learn(&self, ip: IpAddr, mac: [u8; 6], direction: Direction) {
        if ip.is_unspecified() || !is_usable_mac(mac) {
            return;
        }
        let mut table = self.table.lock().unwrap();
        table.insert(ip, Entry { mac, direction, expires: Instant::now() + self.ttl });
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<[u8; 6]> {
        let table = self.table.lock().unwrap();
        table.get(&ip).filter(|e| e.expires > Instant::now()).map(|e| e.mac)
    }

    fn parse_arp(payload: &[u8]) -> Option<(u16, [u8; 6], IpAddr, [u8; 6], IpAddr)> {
        if payload.len() < 28 {
            return None;
        }
        let op = u16::from_be_bytes([payload[6], payload[7]]);
        let sha: [u8; 6] = payload[8..14].try_into().ok()?;
        let spa = IpAddr::from([payload[14], payload[15], payload[16], payload[17]]);
        let tha: [u8; 6] = payload[18..24].try_into().ok()?;
        let tpa = IpAddr::from([payload[24], payload[25], payload[26], payload[27]]);
        Some((op, sha, spa, tha, tpa))
    }

    fn parse_ndp(payload: &[u8]) -> Option<(u8, IpAddr, [u8; 6])> {
        // ICMPv6 type 135 (Neighbor Solicitation) or 136 (Neighbor Advertisement),
        // followed by 4 reserved/flag bytes, a 16-byte target address, and an
        // 8-byte link-layer-address option (type=2 target, type=1 source).
        if payload.len() < 32 {
            return None;
        }
        let icmp_type = payload[0];
        if icmp_type != 135 && icmp_type != 136 {
            return None;
        }
        let target: [u8; 16] = payload[8..24].try_into().ok()?;
        let opt_type = payload[24];
        if opt_type != 1 && opt_type != 2 {
            return None;
        }
        let mac: [u8; 6] = payload[26..32].try_into().ok()?;
        Some((icmp_type, IpAddr::from(target), mac))
    }
}

impl DpiPlugin for NeighborPlugin {
    fn id(&self) -> u32 {
        NEIGHBOR_PLUGIN_ID
    }

    fn name(&self) -> &'static str {
        "neighbor"
    }

    fn on_packet(&self, header: &mut NetHeader<'_>, _acc: AccHandle, _store: &AccumulatorStore) -> PluginDecision {
        if header.ip_protocol == 58 {
            if let Some((icmp_type, addr, mac)) = Self::parse_ndp(header.payload()) {
                let direction = if icmp_type == 135 { Direction::Outbound } else { Direction::Inbound };
                self.learn(addr, mac, direction);
            }
        }

        PluginDecision::Passthru
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn learns_from_arp_reply() {
        let plugin = NeighborPlugin::new(Duration::from_secs(300));
        let mut payload = vec![0u8; 28];
        payload[7] = 2; // reply
        payload[8..14].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        payload[14..18].copy_from_slice(&[10, 0, 0, 1]);
        plugin.learn_arp(&payload);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(plugin.lookup(ip), Some([1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn skips_broadcast_and_zero() {
        let plugin = NeighborPlugin::new(Duration::from_secs(300));
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        plugin.learn(ip, BROADCAST_MAC, Direction::Inbound);
        plugin.learn(ip, ZERO_MAC, Direction::Inbound);
        assert_eq!(plugin.lookup(ip), None);
    }
}
