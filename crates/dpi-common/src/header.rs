//! Header parser (C1).
//!
//! Grounded on `sase-common::flow::PacketMeta::parse`: same Ethernet →
//! IPv4/IPv6 → TCP/UDP dispatch by ethertype, generalized to produce the
//! spec's `NetHeader` (offsets, direction-free view, parsed watermark,
//! fragment rejection) instead of a fixed `FlowKey`-only struct (§4.1).

use crate::error::{DpiError, DpiResult};
use crate::flow::{FlowKey, IpVersion};
use std::net::{Ipv4Addr, Ipv6Addr};

const ETH_HLEN: usize = 14;
const IPV4_MIN_LEN: usize = 20;
const IPV6_FIXED_LEN: usize = 40;

/// Where a packet entered the pipeline (C2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressSource {
    /// Custom-framed UDP socket listener.
    Socket,
    /// netfilter-queue callback.
    Queue {
        /// Receive queue index.
        rx_vidx: u32,
        /// Transmit queue index.
        tx_vidx: u32,
        /// Receive packet index within the queue.
        rx_pidx: u32,
        /// Transmit packet index within the queue.
        tx_pidx: u32,
    },
}

/// A parsed view over one packet buffer (§3 `NetHeader`).
///
/// Holds a mutable borrow of the ingress buffer for the lifetime of one
/// dispatch call, so attribute plugins can rewrite payload bytes in place
/// (DNS answer rewriting, DHCP option append) and recompute checksums
/// before the verdict is handed back (§4.7).
pub struct NetHeader<'a> {
    buf: &'a mut [u8],
    /// Offset of the Ethernet header (almost always 0).
    pub eth_offset: u16,
    /// Offset of the IP header.
    pub ip_offset: u16,
    /// Offset of the L4 header.
    pub l4_offset: u16,
    /// Offset of the L4 payload.
    pub payload_offset: u16,
    /// Bytes consumed while parsing headers (the "parsed watermark").
    pub parsed: u16,
    /// IP version.
    pub ip_version: IpVersion,
    /// IP protocol number.
    pub ip_protocol: u8,
    /// VLAN tag, 0 if none.
    pub vlan: u16,
    /// Where this packet came from.
    pub source: IngressSource,
    /// Set by an attribute plugin that rewrote payload bytes; tells the
    /// ingress adapter to reinject the buffer instead of the original.
    pub payload_updated: bool,
    /// Flow key, `None` only for fragments (which never reach the dispatcher).
    pub flow_key: Option<FlowKey>,
}

impl<'a> NetHeader<'a> {
    /// Parse an Ethernet frame. Returns `Ok(None)` for IPv4 fragments
    /// (non-zero fragment offset or `MF=1`), which must skip DPI entirely
    /// per §4.1's fragment policy, and is otherwise `Ok(Some(header))`.
    pub fn parse(
        buf: &'a mut [u8],
        source: IngressSource,
    ) -> DpiResult<Option<Self>> {
        if buf.len() < ETH_HLEN {
            return Err(DpiError::Truncated {
                need: ETH_HLEN,
                have: buf.len(),
            });
        }
        let ethertype = u16::from_be_bytes([buf[12], buf[13]]);
        match ethertype {
            0x0800 => Self::parse_ipv4(buf, source),
            0x86DD => Self::parse_ipv6(buf, source),
            other => Err(DpiError::UnsupportedEtherType(other)),
        }
    }

    fn parse_ipv4(buf: &'a mut [u8], source: IngressSource) -> DpiResult<Option<Self>> {
        let ip_offset = ETH_HLEN;
        if buf.len() < ip_offset + IPV4_MIN_LEN {
            return Err(DpiError::Truncated {
                need: ip_offset + IPV4_MIN_LEN,
                have: buf.len(),
            });
        }
        let ip = &buf[ip_offset..];
        let ihl = (ip[0] & 0x0f) as usize * 4;
        if ihl < IPV4_MIN_LEN {
            return Err(DpiError::InvalidIpv4("ihl < 5"));
        }
        let total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;
        if total_len < ihl || ip_offset + total_len > buf.len() {
            return Err(DpiError::InvalidIpv4("total length shorter than header"));
        }

        let flags_frag = u16::from_be_bytes([ip[6], ip[7]]);
        let more_fragments = flags_frag & 0x2000 != 0;
        let frag_offset = flags_frag & 0x1fff;
        if more_fragments || frag_offset != 0 {
            // Fragment: no flow key, caller must not dispatch to DPI.
            return Ok(None);
        }

        let protocol = ip[9];
        let src = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
        let dst = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);

        let l4_offset = ip_offset + ihl;
        let (sport, dport, icmp_id, l4_hdr_len) =
            parse_l4(&buf[l4_offset..], protocol)?;
        let payload_offset = l4_offset + l4_hdr_len;

        let smac: [u8; 6] = buf[6..12].try_into().unwrap();
        let dmac: [u8; 6] = buf[0..6].try_into().unwrap();
        let flow_key = Some(FlowKey::from_v4(
            smac, dmac, 0, protocol, src, dst, sport, dport, icmp_id,
        ));

        Ok(Some(Self {
            buf,
            eth_offset: 0,
            ip_offset: ip_offset as u16,
            l4_offset: l4_offset as u16,
            payload_offset: payload_offset as u16,
            parsed: payload_offset as u16,
            ip_version: IpVersion::V4,
            ip_protocol: protocol,
            vlan: 0,
            source,
            payload_updated: false,
            flow_key,
        }))
    }

    fn parse_ipv6(buf: &'a mut [u8], source: IngressSource) -> DpiResult<Option<Self>> {
        let ip_offset = ETH_HLEN;
        if buf.len() < ip_offset + IPV6_FIXED_LEN {
            return Err(DpiError::Truncated {
                need: ip_offset + IPV6_FIXED_LEN,
                have: buf.len(),
            });
        }
        let ip = &buf[ip_offset..ip_offset + IPV6_FIXED_LEN];
        let mut protocol = ip[6];
        let src = Ipv6Addr::from(<[u8; 16]>::try_from(&ip[8..24]).unwrap());
        let dst = Ipv6Addr::from(<[u8; 16]>::try_from(&ip[24..40]).unwrap());

        // Walk extension headers far enough to detect the fragment header
        // (next_header == 44); anything deeper is out of scope for the hot
        // path and is handled as an opaque L4 protocol.
        let mut l4_offset = ip_offset + IPV6_FIXED_LEN;
        if protocol == 44 {
            if buf.len() < l4_offset + 8 {
                return Err(DpiError::InvalidIpv6("truncated fragment header"));
            }
            let frag_hdr = &buf[l4_offset..l4_offset + 8];
            let frag_offset_flags = u16::from_be_bytes([frag_hdr[2], frag_hdr[3]]);
            let frag_offset = frag_offset_flags >> 3;
            let more_fragments = frag_offset_flags & 1 != 0;
            if more_fragments || frag_offset != 0 {
                return Ok(None);
            }
            protocol = frag_hdr[0];
            l4_offset += 8;
        }

        let (sport, dport, icmp_id, l4_hdr_len) =
            parse_l4(&buf[l4_offset..], protocol)?;
        let payload_offset = l4_offset + l4_hdr_len;

        let smac: [u8; 6] = buf[6..12].try_into().unwrap();
        let dmac: [u8; 6] = buf[0..6].try_into().unwrap();
        let flow_key = Some(FlowKey::from_v6(
            smac, dmac, 0, protocol, src, dst, sport, dport, icmp_id,
        ));

        Ok(Some(Self {
            buf,
            eth_offset: 0,
            ip_offset: ip_offset as u16,
            l4_offset: l4_offset as u16,
            payload_offset: payload_offset as u16,
            parsed: payload_offset as u16,
            ip_version: IpVersion::V6,
            ip_protocol: protocol,
            vlan: 0,
            source,
            payload_updated: false,
            flow_key,
        }))
    }

    /// Immutable view of the whole buffer.
    pub fn buf(&self) -> &[u8] {
        self.buf
    }

    /// Mutable view of the whole buffer, for in-place rewrites.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        self.buf
    }

    /// L4 payload slice (DNS message, DHCP body, ...).
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload_offset as usize..]
    }

    /// Number of payload bytes, i.e. `packet_len - parsed`.
    pub fn payload_len(&self) -> usize {
        self.buf.len() - self.payload_offset as usize
    }
}

/// Returns `(src_port, dst_port, icmp_id, l4_header_len)`.
fn parse_l4(l4: &[u8], protocol: u8) -> DpiResult<(u16, u16, Option<u16>, usize)> {
    match protocol {
        6 => {
            // TCP: data offset is the high nibble of byte 12, in 32-bit words.
            if l4.len() < 20 {
                return Err(DpiError::Truncated { need: 20, have: l4.len() });
            }
            let sport = u16::from_be_bytes([l4[0], l4[1]]);
            let dport = u16::from_be_bytes([l4[2], l4[3]]);
            let data_offset = ((l4[12] >> 4) as usize) * 4;
            Ok((sport, dport, None, data_offset.max(20)))
        }
        17 => {
            if l4.len() < 8 {
                return Err(DpiError::Truncated { need: 8, have: l4.len() });
            }
            let sport = u16::from_be_bytes([l4[0], l4[1]]);
            let dport = u16::from_be_bytes([l4[2], l4[3]]);
            Ok((sport, dport, None, 8))
        }
        1 => {
            // ICMP: identifier lives at bytes 4..6 for echo request/reply.
            if l4.len() < 8 {
                return Err(DpiError::Truncated { need: 8, have: l4.len() });
            }
            let id = u16::from_be_bytes([l4[4], l4[5]]);
            Ok((0, 0, Some(id), 8))
        }
        58 => {
            // ICMPv6
            if l4.len() < 8 {
                return Err(DpiError::Truncated { need: 8, have: l4.len() });
            }
            let icmp_type = l4[0];
            let id = if matches!(icmp_type, 128 | 129) {
                Some(u16::from_be_bytes([l4[4], l4[5]]))
            } else {
                None
            };
            Ok((0, 0, id, 8))
        }
        _ => Ok((0, 0, None, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth_ipv4_tcp() -> Vec<u8> {
        let mut pkt = vec![
            0, 0, 0, 0, 0, 2, // dst mac
            0, 0, 0, 0, 0, 1, // src mac
            0x08, 0x00, // IPv4
            0x45, 0x00, 0x00, 0x28, // version/ihl, tos, total len = 40
            0x00, 0x00, 0x00, 0x00, // id, flags/frag
            0x40, 0x06, 0x00, 0x00, // ttl, proto=TCP, checksum
            192, 168, 1, 1, // src
            10, 0, 0, 1, // dst
            0x30, 0x39, 0x01, 0xbb, // ports 12345 -> 443
            0, 0, 0, 0, // seq
            0, 0, 0, 0, // ack
            0x50, 0x00, 0x00, 0x00, // data offset = 5, flags, window
            0, 0, 0, 0, // checksum, urgent
        ];
        pkt.resize(14 + 40, 0);
        pkt
    }

    #[test]
    fn parses_tcp_flow_key() {
        let mut pkt = eth_ipv4_tcp();
        let hdr = NetHeader::parse(&mut pkt, IngressSource::Socket)
            .unwrap()
            .expect("not a fragment");
        let key = hdr.flow_key.unwrap();
        assert_eq!(key.sport, 12345);
        assert_eq!(key.dport, 443);
        assert_eq!(key.protocol, 6);
    }

    #[test]
    fn fragment_yields_no_flow_key() {
        let mut pkt = eth_ipv4_tcp();
        // Set MF bit.
        pkt[14 + 6] = 0x20;
        let hdr = NetHeader::parse(&mut pkt, IngressSource::Socket).unwrap();
        assert!(hdr.is_none());
    }

    #[test]
    fn rejects_short_ihl() {
        let mut pkt = eth_ipv4_tcp();
        pkt[14] = 0x44; // ihl = 4 words = 16 bytes, below the 20 byte minimum
        let err = NetHeader::parse(&mut pkt, IngressSource::Socket).unwrap_err();
        assert!(matches!(err, DpiError::InvalidIpv4(_)));
    }
}
