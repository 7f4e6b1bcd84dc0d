//! Flow key identity.
//!
//! Grounded on `sase-common::flow::FlowKey`: same cache-line-friendly shape
//! and FxHash-style mixing, generalized from the teacher's plain 5-tuple to
//! the spec's `{smac, dmac, vlan, ethertype, ipver, proto, sip, dip, sport,
//! dport, icmp_id}` key (§3).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IP version carried by a header or flow key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

/// Direction of a flow relative to the gateway's LAN side.
///
/// This is a property of the accumulator, never the parser (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    /// Not yet determined.
    #[default]
    Unset,
    /// LAN device talking to a WAN destination.
    Outbound,
    /// WAN source talking to a LAN device.
    Inbound,
    /// Both endpoints on the LAN.
    Lan2Lan,
}

/// Flow identity: the 5-tuple plus link-layer context (§3 `FlowKey`).
///
/// Fragmented IPv4 packets never produce a `FlowKey` — see
/// [`crate::header::NetHeader::parse`]'s fragment rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Source MAC address.
    pub smac: [u8; 6],
    /// Destination MAC address.
    pub dmac: [u8; 6],
    /// VLAN tag, 0 if untagged.
    pub vlan: u16,
    /// Ethertype (0x0800 or 0x86DD on the hot path).
    pub ethertype: u16,
    /// IP version.
    pub ip_version: IpVersion,
    /// IP protocol number (TCP=6, UDP=17, ICMP=1, ICMPv6=58, ...).
    pub protocol: u8,
    /// Source address, stored as the widened representation.
    pub sip: IpAddr,
    /// Destination address.
    pub dip: IpAddr,
    /// Source port (0 for protocols without ports).
    pub sport: u16,
    /// Destination port.
    pub dport: u16,
    /// ICMP identifier, present only for ICMP echo request/reply flows.
    pub icmp_id: Option<u16>,
}

impl FlowKey {
    /// Build a key from an IPv4 5-tuple plus link-layer fields.
    #[allow(clippy::too_many_arguments)]
    pub fn from_v4(
        smac: [u8; 6],
        dmac: [u8; 6],
        vlan: u16,
        protocol: u8,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        sport: u16,
        dport: u16,
        icmp_id: Option<u16>,
    ) -> Self {
        Self {
            smac,
            dmac,
            vlan,
            ethertype: 0x0800,
            ip_version: IpVersion::V4,
            protocol,
            sip: IpAddr::V4(src),
            dip: IpAddr::V4(dst),
            sport,
            dport,
            icmp_id,
        }
    }

    /// Build a key from an IPv6 5-tuple plus link-layer fields.
    #[allow(clippy::too_many_arguments)]
    pub fn from_v6(
        smac: [u8; 6],
        dmac: [u8; 6],
        vlan: u16,
        protocol: u8,
        src: Ipv6Addr,
        dst: Ipv6Addr,
        sport: u16,
        dport: u16,
        icmp_id: Option<u16>,
    ) -> Self {
        Self {
            smac,
            dmac,
            vlan,
            ethertype: 0x86DD,
            ip_version: IpVersion::V6,
            protocol,
            sip: IpAddr::V6(src),
            dip: IpAddr::V6(dst),
            sport,
            dport,
            icmp_id,
        }
    }

    /// Reverse key, used to match the return direction of a flow.
    pub fn reverse(&self) -> Self {
        Self {
            smac: self.dmac,
            dmac: self.smac,
            vlan: self.vlan,
            ethertype: self.ethertype,
            ip_version: self.ip_version,
            protocol: self.protocol,
            sip: self.dip,
            dip: self.sip,
            sport: self.dport,
            dport: self.sport,
            icmp_id: self.icmp_id,
        }
    }

    /// FxHash-style mix, fast enough for the hot accumulator lookup path.
    #[inline(always)]
    pub fn fx_hash(&self) -> u64 {
        const K: u64 = 0x517c_c1b7_2722_0a95;

        #[inline(always)]
        fn ip_halves(ip: IpAddr) -> (u64, u64) {
            match ip {
                IpAddr::V4(v4) => (u32::from_be_bytes(v4.octets()) as u64, 0),
                IpAddr::V6(v6) => {
                    let bits = u128::from_be_bytes(v6.octets());
                    (bits as u64, (bits >> 64) as u64)
                }
            }
        }

        let (slo, shi) = ip_halves(self.sip);
        let (dlo, dhi) = ip_halves(self.dip);

        let mut h: u64 = 0;
        h = h.wrapping_add(slo.wrapping_mul(K)).rotate_left(31);
        h = h.wrapping_add(shi.wrapping_mul(K)).rotate_left(31);
        h = h.wrapping_add(dlo.wrapping_mul(K)).rotate_left(31);
        h = h.wrapping_add(dhi.wrapping_mul(K)).rotate_left(31);
        let tail = (self.sport as u64) << 48
            | (self.dport as u64) << 32
            | (self.protocol as u64) << 24
            | (self.vlan as u64);
        h = h.wrapping_add(tail.wrapping_mul(K)).rotate_left(31);
        h
    }
}

/// Vendor classification attached to an accumulator's reportable key once
/// the signature plugin reaches `Matched` (§4.5 step 4).
#[derive(Debug, Clone, Default)]
pub struct FlowTag {
    pub vendor: String,
    pub app_name: String,
    pub tags: Vec<String>,
    /// Time-on-line, in milliseconds, from stream creation to match.
    pub tol_ms: u64,
    pub pkts_scanned: u64,
    pub diagnostic: Option<String>,
    pub server_name: Option<String>,
    pub scan_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FlowKey {
        FlowKey::from_v4(
            [0, 1, 2, 3, 4, 5],
            [6, 7, 8, 9, 10, 11],
            0,
            6,
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            12345,
            443,
            None,
        )
    }

    #[test]
    fn hash_is_stable_and_nonzero() {
        let k = key();
        assert_ne!(k.fx_hash(), 0);
        assert_eq!(k.fx_hash(), k.fx_hash());
    }

    #[test]
    fn reverse_swaps_endpoints() {
        let k = key();
        let r = k.reverse();
        assert_eq!(r.sip, k.dip);
        assert_eq!(r.dip, k.sip);
        assert_eq!(r.sport, k.dport);
        assert_eq!(r.dport, k.sport);
        assert_eq!(r.smac, k.dmac);
    }

    #[test]
    fn v6_key_keeps_full_address() {
        let k = FlowKey::from_v6(
            [0; 6],
            [0; 6],
            0,
            17,
            Ipv6Addr::LOCALHOST,
            Ipv6Addr::UNSPECIFIED,
            53,
            5353,
            None,
        );
        assert_eq!(k.ip_version, IpVersion::V6);
        assert_eq!(k.ethertype, 0x86DD);
    }
}
