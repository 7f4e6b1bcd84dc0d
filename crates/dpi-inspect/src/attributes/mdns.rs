//! mDNS responder plugin (§4.6). Answers configured service-announcement
//! names over multicast UDP; IPv6 queries short-circuit to no-response per
//! the spec's explicit scope limit.
//!
//! Question-name parsing reuses the compression-pointer walk from
//! [`crate::attributes::dns`].

use dpi_common::header::NetHeader;
use dpi_dataplane::{AccHandle, AccumulatorStore, DpiPlugin, PluginDecision};
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Mutex;

pub const MDNS_PLUGIN_ID: u32 = 400;

const MDNS_PORT: u16 = 5353;

fn read_qname(buf: &[u8], mut off: usize) -> Option<(String, usize)> {
    let mut labels = Vec::new();
    loop {
        let len = *buf.get(off)? as usize;
        if len == 0 {
            off += 1;
            break;
        }
        if len & 0xc0 == 0xc0 {
            off += 2;
            break;
        }
        let start = off + 1;
        let end = start + len;
        labels.push(String::from_utf8_lossy(buf.get(start..end)?).to_string());
        off = end;
    }
    Some((labels.join("."), off))
}

/// A locally announced service, keyed by its fully-qualified mDNS name.
#[derive(Debug, Clone)]
pub struct ServiceAnnouncement {
    pub qname: String,
    pub address: std::net::Ipv4Addr,
    pub ttl: u32,
}

pub struct MdnsPlugin {
    services: HashMap<String, ServiceAnnouncement>,
    socket: Option<Mutex<UdpSocket>>,
}

impl MdnsPlugin {
    pub fn new(services: Vec<ServiceAnnouncement>, source_addr: Option<SocketAddr>) -> Self {
        let socket = source_addr.and_then(|addr| UdpSocket::bind(addr).ok()).map(Mutex::new);
        Self { services: services.into_iter().map(|s| (s.qname.clone(), s)).collect(), socket }
    }

    fn encode_response(service: &ServiceAnnouncement) -> Vec<u8> {
        let mut msg = vec![0u8; 12];
        msg[2] = 0x84; // QR=1, AA=1
        msg[7] = 1; // ancount = 1
        for label in service.qname.split('.') {
            msg.push(label.len() as u8);
            msg.extend_from_slice(label.as_bytes());
        }
        msg.push(0);
        msg.extend_from_slice(&[0, 1, 0, 1]); // type=A class=IN
        msg.extend_from_slice(&service.ttl.to_be_bytes());
        msg.extend_from_slice(&[0, 4]);
        msg.extend_from_slice(&service.address.octets());
        msg
    }
}

impl DpiPlugin for MdnsPlugin {
    fn id(&self) -> u32 {
        MDNS_PLUGIN_ID
    }

    fn name(&self) -> &'static str {
        "mdns"
    }

    fn on_packet(&self, header: &mut NetHeader<'_>, _acc: AccHandle, _store: &AccumulatorStore) -> PluginDecision {
        if header.ip_protocol != 17 {
            return PluginDecision::Passthru;
        }
        if matches!(header.ip_version, dpi_common::flow::IpVersion::V6) {
            // IPv6 mDNS queries are not supported (§4.6).
            return PluginDecision::Passthru;
        }
        let l4 = header.l4_offset as usize;
        let dport = u16::from_be_bytes([header.buf()[l4 + 2], header.buf()[l4 + 3]]);
        if dport != MDNS_PORT {
            return PluginDecision::Passthru;
        }

        let payload = header.payload();
        if payload.len() < 12 {
            return PluginDecision::Passthru;
        }
        let qdcount = u16::from_be_bytes([payload[4], payload[5]]) as usize;
        if qdcount == 0 {
            return PluginDecision::Passthru;
        }
        let Some((qname, _)) = read_qname(payload, 12) else {
            return PluginDecision::Passthru;
        };

        if let Some(service) = self.services.get(&qname) {
            if let Some(socket) = &self.socket {
                let response = Self::encode_response(service);
                let dst = SocketAddr::from(([224, 0, 0, 251], MDNS_PORT));
                let _ = socket.lock().unwrap().send_to(&response, dst);
            }
        }

        PluginDecision::Passthru
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_a_response_for_announced_service() {
        let svc = ServiceAnnouncement {
            qname: "printer.local".to_string(),
            address: "192.168.1.50".parse().unwrap(),
            ttl: 120,
        };
        let msg = MdnsPlugin::encode_response(&svc);
        assert_eq!(msg[7], 1);
        assert!(msg.windows(7).any(|w| w == b"printer"));
    }
}
