//! DNS attribute plugin (§4.6).
//!
//! Wire-format parsing (name/compression-pointer skipping, answer walking)
//! is grounded on `sase-ips::protocols::dns::DnsAnalyzer::parse_dns`; its
//! DGA/tunneling entropy heuristics have no counterpart in this plugin's
//! contract and are not carried over (see DESIGN.md).

use dpi_common::checksum::{ipv4_checksum, udp_checksum_v6};
use dpi_common::header::NetHeader;
use dpi_dataplane::{AccHandle, AccumulatorStore, DpiPlugin, PluginDecision};
use dpi_policy::cache::{Direction as CacheDirection, VerdictCache};
use dpi_policy::engine::PolicyEngine;
use dpi_policy::request::{PolicyRequest, ReqType};
use dpi_policy::rule::PolicyAction;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

pub const DNS_PLUGIN_ID: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnswerType {
    A,
    Aaaa,
}

struct Answer {
    kind: AnswerType,
    /// Offset of the TTL field, relative to the start of the payload.
    ttl_offset: usize,
    /// Offset of the address rdata, relative to the start of the payload.
    addr_offset: usize,
    address: IpAddr,
}

struct DnsMessage {
    qname: String,
    qtype: u16,
    answers: Vec<Answer>,
    /// Offset, relative to the payload start, right past the question
    /// section — where a no-answer rewrite truncates to.
    question_end: usize,
}

fn mac_string(mac: [u8; 6]) -> String {
    format!("{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", mac[0], mac[1], mac[2], mac[3], mac[4], mac[5])
}

fn skip_name(buf: &[u8], mut off: usize) -> Option<usize> {
    loop {
        let len = *buf.get(off)?;
        if len == 0 {
            return Some(off + 1);
        }
        if len & 0xc0 == 0xc0 {
            // Compression pointer: two bytes, terminates the name here.
            return Some(off + 2);
        }
        off += 1 + len as usize;
        if off > buf.len() {
            return None;
        }
    }
}

fn read_name(buf: &[u8], mut off: usize) -> Option<(String, usize)> {
    let mut labels = Vec::new();
    loop {
        let len = *buf.get(off)? as usize;
        if len == 0 {
            off += 1;
            break;
        }
        if len & 0xc0 == 0xc0 {
            let ptr_hi = (len & 0x3f) as usize;
            let ptr_lo = *buf.get(off + 1)? as usize;
            let ptr = (ptr_hi << 8) | ptr_lo;
            let (tail, _) = read_name(buf, ptr)?;
            labels.push(tail);
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

/// Parse a DNS message, recognized query types only (A=1, AAAA=28, 65=HTTPS, 64=SVCB).
fn parse_dns(payload: &[u8]) -> Option<DnsMessage> {
    if payload.len() < 12 {
        return None;
    }
    let qdcount = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    let ancount = u16::from_be_bytes([payload[6], payload[7]]) as usize;
    if qdcount == 0 {
        return None;
    }

    let mut off = 12;
    let (qname, after_name) = read_name(payload, off)?;
    off = after_name;
    let qtype = u16::from_be_bytes([*payload.get(off)?, *payload.get(off + 1)?]);
    off += 4; // qtype + qclass

    // Skip any additional questions (qdcount > 1 is unusual but handled).
    for _ in 1..qdcount {
        off = skip_name(payload, off)?;
        off += 4;
    }

    let question_end = off;

    let mut answers = Vec::new();
    for _ in 0..ancount {
        off = skip_name(payload, off)?;
        let rtype = u16::from_be_bytes([*payload.get(off)?, *payload.get(off + 1)?]);
        let ttl_offset = off + 4;
        let rdlength = u16::from_be_bytes([*payload.get(off + 8)?, *payload.get(off + 9)?]) as usize;
        let rdata_offset = off + 10;
        match rtype {
            1 if rdlength == 4 => {
                let b = payload.get(rdata_offset..rdata_offset + 4)?;
                answers.push(Answer {
                    kind: AnswerType::A,
                    ttl_offset,
                    addr_offset: rdata_offset,
                    address: IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])),
                });
            }
            28 if rdlength == 16 => {
                let b: [u8; 16] = payload.get(rdata_offset..rdata_offset + 16)?.try_into().ok()?;
                answers.push(Answer {
                    kind: AnswerType::Aaaa,
                    ttl_offset,
                    addr_offset: rdata_offset,
                    address: IpAddr::V6(Ipv6Addr::from(b)),
                });
            }
            _ => {}
        }
        off = rdata_offset + rdlength;
        if answers.len() >= 64 {
            break;
        }
    }

    Some(DnsMessage { qname, qtype, answers, question_end })
}

fn recognized_qtype(qtype: u16) -> bool {
    matches!(qtype, 1 | 28 | 65 | 64)
}

pub struct DnsPlugin {
    policy: Arc<PolicyEngine>,
    cache: Arc<VerdictCache>,
    table_name: String,
    local_mac: [u8; 6],
    report_sink: Option<dpi_report::ReportSink>,
}

impl DnsPlugin {
    pub fn new(policy: Arc<PolicyEngine>, cache: Arc<VerdictCache>, table_name: impl Into<String>, local_mac: [u8; 6]) -> Self {
        Self { policy, cache, table_name: table_name.into(), local_mac, report_sink: None }
    }

    pub fn with_report_sink(mut self, sink: dpi_report::ReportSink) -> Self {
        self.report_sink = Some(sink);
        self
    }

    /// Emit a URL report for `qname` iff the policy reply asked for one
    /// (§6 "Reports are sent iff `reply.to_report == true`").
    fn maybe_report(&self, qname: &str, reply: &dpi_policy::request::PolicyReply) {
        let Some(sink) = &self.report_sink else { return };
        if !reply.to_report {
            return;
        }
        let timestamp_ms =
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0);
        sink.emit_url(&dpi_report::UrlReport {
            device_id: mac_string(self.local_mac),
            url: qname.to_string(),
            action: reply.log_action.clone(),
            rule_name: reply.rule_name.clone(),
            policy_name: reply.policy_name.clone(),
            timestamp_ms,
            categories: None,
            risk_level: reply.risk_level,
        });
    }

    fn rewrite_answer(header: &mut NetHeader<'_>, answer: &Answer, target: IpAddr, new_ttl: Option<u32>) {
        let payload_base = header.payload_offset as usize;
        let buf = header.buf_mut();
        if let Some(ttl) = new_ttl {
            buf[payload_base + answer.ttl_offset..payload_base + answer.ttl_offset + 4]
                .copy_from_slice(&ttl.to_be_bytes());
        }
        match (answer.kind, target) {
            (AnswerType::A, IpAddr::V4(v4)) => {
                buf[payload_base + answer.addr_offset..payload_base + answer.addr_offset + 4]
                    .copy_from_slice(&v4.octets());
            }
            (AnswerType::Aaaa, IpAddr::V6(v6)) => {
                buf[payload_base + answer.addr_offset..payload_base + answer.addr_offset + 16]
                    .copy_from_slice(&v6.octets());
            }
            _ => {}
        }
    }

    /// Recompute IPv4/UDP checksums over `[l4_offset, payload_end)`.
    /// `payload_end` is an absolute buffer offset so a caller that shrank
    /// the packet (NXDOMAIN truncation) can checksum only the retained
    /// bytes instead of the whole (now stale-tailed) buffer.
    fn fix_checksums(header: &mut NetHeader<'_>, payload_end: usize) {
        let ip_offset = header.ip_offset as usize;
        let l4_offset = header.l4_offset as usize;
        match header.ip_version {
            dpi_common::flow::IpVersion::V4 => {
                let ihl = (header.buf()[ip_offset] & 0x0f) as usize * 4;
                let ip_end = ip_offset + ihl;
                {
                    let buf = header.buf_mut();
                    ipv4_checksum(&mut buf[ip_offset..ip_end]);
                }
                dpi_common::checksum::udp_checksum_zero(&mut header.buf_mut()[l4_offset..l4_offset + 8]);
            }
            dpi_common::flow::IpVersion::V6 => {
                let src: [u8; 16] = header.buf()[ip_offset + 8..ip_offset + 24].try_into().unwrap();
                let dst: [u8; 16] = header.buf()[ip_offset + 24..ip_offset + 40].try_into().unwrap();
                let buf = header.buf_mut();
                udp_checksum_v6(&src, &dst, &mut buf[l4_offset..payload_end]);
            }
        }
        header.payload_updated = true;
    }

    /// Reduce the IPv4 total-length/IPv6 payload-length and UDP-length
    /// fields by `reduction` bytes, following a payload truncation.
    fn shrink_transport_lengths(header: &mut NetHeader<'_>, reduction: usize) {
        let ip_offset = header.ip_offset as usize;
        let l4_offset = header.l4_offset as usize;
        let buf = header.buf_mut();
        match header.ip_version {
            dpi_common::flow::IpVersion::V4 => {
                let total_len = u16::from_be_bytes([buf[ip_offset + 2], buf[ip_offset + 3]]) as usize;
                let new_len = (total_len - reduction) as u16;
                buf[ip_offset + 2..ip_offset + 4].copy_from_slice(&new_len.to_be_bytes());
            }
            dpi_common::flow::IpVersion::V6 => {
                let payload_len = u16::from_be_bytes([buf[ip_offset + 4], buf[ip_offset + 5]]) as usize;
                let new_len = (payload_len - reduction) as u16;
                buf[ip_offset + 4..ip_offset + 6].copy_from_slice(&new_len.to_be_bytes());
            }
        }
        let udp_len = u16::from_be_bytes([buf[l4_offset + 4], buf[l4_offset + 5]]) as usize;
        let new_udp_len = (udp_len - reduction) as u16;
        buf[l4_offset + 4..l4_offset + 6].copy_from_slice(&new_udp_len.to_be_bytes());
    }

    /// Rewrite the response into "no-error no-answer" (`rcode = 3`,
    /// `ancount = nscount = arcount = 0`), truncated past the question
    /// section (§4.6 step 5, tested at spec.md's "DNS block" scenario).
    /// Grounded on `fsm_dpi_dns_set_noerror_noanswer`, which ORs the same
    /// two low flag bits and shrinks `caplen` by the dropped answer bytes.
    fn rewrite_to_nxdomain(header: &mut NetHeader<'_>, msg: &DnsMessage) {
        let payload_base = header.payload_offset as usize;
        let old_payload_len = header.payload_len();
        let reduction = old_payload_len.saturating_sub(msg.question_end);

        {
            let buf = header.buf_mut();
            let flags = u16::from_be_bytes([buf[payload_base + 2], buf[payload_base + 3]]) | 0x0003;
            buf[payload_base + 2..payload_base + 4].copy_from_slice(&flags.to_be_bytes());
            buf[payload_base + 6..payload_base + 8].copy_from_slice(&[0, 0]);
            buf[payload_base + 8..payload_base + 10].copy_from_slice(&[0, 0]);
            buf[payload_base + 10..payload_base + 12].copy_from_slice(&[0, 0]);
        }

        if reduction > 0 {
            Self::shrink_transport_lengths(header, reduction);
        }
        Self::fix_checksums(header, payload_base + msg.question_end);
    }
}

impl DpiPlugin for DnsPlugin {
    fn id(&self) -> u32 {
        DNS_PLUGIN_ID
    }

    fn name(&self) -> &'static str {
        "dns"
    }

    fn on_packet(&self, header: &mut NetHeader<'_>, _acc: AccHandle, _store: &AccumulatorStore) -> PluginDecision {
        if header.ip_protocol != 17 {
            return PluginDecision::Passthru;
        }
        let l4 = header.l4_offset as usize;
        let sport = u16::from_be_bytes([header.buf()[l4], header.buf()[l4 + 1]]);
        if sport != 53 {
            // Not a DNS response; this plugin only rewrites answers (§4.6).
            return PluginDecision::Passthru;
        }

        let Some(msg) = parse_dns(header.payload()) else {
            return PluginDecision::Passthru;
        };
        if !recognized_qtype(msg.qtype) {
            return PluginDecision::Passthru;
        }

        let mut req = PolicyRequest::new(ReqType::Fqdn, self.local_mac);
        req.url = Some(msg.qname.clone());
        let reply = self.policy.apply(&self.table_name, &req);
        self.maybe_report(&msg.qname, &reply);

        let ttl_floor = Duration::from_secs(6 * 3600);
        for answer in &msg.answers {
            let raw_ttl: [u8; 4] = header.payload()[answer.ttl_offset..answer.ttl_offset + 4].try_into().unwrap();
            let provider_ttl = Duration::from_secs(u32::from_be_bytes(raw_ttl) as u64);
            self.cache.add_ip_entry(
                self.local_mac,
                answer.address,
                CacheDirection::Outbound,
                reply.action,
                provider_ttl.max(ttl_floor),
            );
        }

        match reply.action {
            PolicyAction::Block => {
                // §4.6 step 5 / spec.md's "DNS block" scenario: rewrite to
                // NXDOMAIN rather than substituting an address, since there
                // is no configured block target to redirect to.
                Self::rewrite_to_nxdomain(header, &msg);
            }
            PolicyAction::Redirect => {
                let new_ttl = if reply.rd_ttl >= 0 { Some(reply.rd_ttl as u32) } else { None };
                let redirects = reply.redirects.clone();
                let mut rewrote_any = false;
                for answer in &msg.answers {
                    let target = match answer.kind {
                        AnswerType::A => {
                            redirects[0].as_ref().and_then(|s| s.parse::<Ipv4Addr>().ok()).map(IpAddr::V4)
                        }
                        AnswerType::Aaaa => {
                            redirects[1].as_ref().and_then(|s| s.parse::<Ipv6Addr>().ok()).map(IpAddr::V6)
                        }
                    };
                    // Boundary behavior: an answer kind with no matching
                    // redirect configured is left unrewritten (spec.md:
                    // "Redirect with IPv6 answer but only IPv4 redirect
                    // configured: no rewrite, action returned unchanged").
                    let Some(target) = target else { continue };
                    Self::rewrite_answer(header, answer, target, new_ttl);
                    self.cache.add_redirect_entry(self.local_mac, target, CacheDirection::Outbound, None);
                    rewrote_any = true;
                }
                if rewrote_any {
                    let buf_len = header.buf().len();
                    Self::fix_checksums(header, buf_len);
                }
            }
            _ => {}
        }

        PluginDecision::Passthru
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_response(ip: Ipv4Addr, ttl: u32) -> Vec<u8> {
        let mut msg = vec![0u8; 12];
        msg[6] = 0;
        msg[7] = 1; // ancount = 1
        msg[4] = 0;
        msg[5] = 1; // qdcount = 1
        msg.extend_from_slice(&[3, b'w', b'w', b'w', 7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0]);
        msg.extend_from_slice(&[0, 1, 0, 1]); // qtype=A qclass=IN
        msg.extend_from_slice(&[0xc0, 0x0c]); // name pointer
        msg.extend_from_slice(&[0, 1, 0, 1]); // type=A class=IN
        msg.extend_from_slice(&ttl.to_be_bytes());
        msg.extend_from_slice(&[0, 4]);
        msg.extend_from_slice(&ip.octets());
        msg
    }

    #[test]
    fn parses_single_a_answer() {
        let payload = query_response(Ipv4Addr::new(93, 184, 216, 34), 300);
        let parsed = parse_dns(&payload).unwrap();
        assert_eq!(parsed.qname, "www.example.com");
        assert_eq!(parsed.qtype, 1);
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.answers[0].address, IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
    }

    fn build_packet(dns_payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 14];
        pkt[12] = 0x08;
        pkt[13] = 0x00;

        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        let total_len = (20 + 8 + dns_payload.len()) as u16;
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip[8] = 64;
        ip[9] = 17; // UDP
        ip[12..16].copy_from_slice(&[93, 184, 216, 34]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 1]);

        let mut udp = vec![0u8; 8];
        udp[0..2].copy_from_slice(&53u16.to_be_bytes());
        udp[2..4].copy_from_slice(&12345u16.to_be_bytes());
        let udp_len = (8 + dns_payload.len()) as u16;
        udp[4..6].copy_from_slice(&udp_len.to_be_bytes());

        pkt.extend_from_slice(&ip);
        pkt.extend_from_slice(&udp);
        pkt.extend_from_slice(dns_payload);
        pkt
    }

    fn dummy_handle(store: &AccumulatorStore) -> AccHandle {
        store.insert(dpi_common::flow::FlowKey {
            smac: [0; 6],
            dmac: [0; 6],
            vlan: 0,
            ethertype: 0x0800,
            ip_version: dpi_common::flow::IpVersion::V4,
            protocol: 17,
            sip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dip: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            sport: 53,
            dport: 12345,
            icmp_id: None,
        })
    }

    fn block_table(qname: &str) -> dpi_policy::rule::PolicyTable {
        let mut rule = dpi_policy::rule::PolicyRule::new("block-it", 0, PolicyAction::Block);
        rule.fqdn_rule = Some(dpi_policy::rule::FqdnPredicate {
            mode: dpi_policy::rule::FqdnMatchMode::Exact,
            invert: false,
            operands: vec![dpi_policy::rule::Operand::Literal(qname.to_string())],
        });
        rule.report_level = dpi_policy::rule::ReportLevel::All;
        dpi_policy::rule::PolicyTable::new("lan", vec![rule])
    }

    fn redirect_table(qname: &str, redirect_v4: &str, rd_ttl: i64) -> dpi_policy::rule::PolicyTable {
        let mut rule = dpi_policy::rule::PolicyRule::new("redirect-it", 0, PolicyAction::Redirect);
        rule.fqdn_rule = Some(dpi_policy::rule::FqdnPredicate {
            mode: dpi_policy::rule::FqdnMatchMode::Exact,
            invert: false,
            operands: vec![dpi_policy::rule::Operand::Literal(qname.to_string())],
        });
        rule.redirects = [Some(redirect_v4.to_string()), None];
        rule.other_config.rd_ttl = rd_ttl;
        rule.report_level = dpi_policy::rule::ReportLevel::All;
        dpi_policy::rule::PolicyTable::new("lan", vec![rule])
    }

    #[test]
    fn block_rewrites_response_to_nxdomain() {
        let payload = query_response(Ipv4Addr::new(1, 2, 3, 4), 300);
        let mut pkt = build_packet(&payload);

        let policy = Arc::new(PolicyEngine::new());
        policy.update_table(block_table("www.example.com"));
        let cache = Arc::new(VerdictCache::new());
        let plugin = DnsPlugin::new(policy, cache, "lan", [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);

        let store = AccumulatorStore::new(Duration::from_secs(60));
        let acc = dummy_handle(&store);

        let mut header = NetHeader::parse(&mut pkt, dpi_common::header::IngressSource::Socket).unwrap().unwrap();
        let payload_offset = header.payload_offset as usize;
        let ip_offset = header.ip_offset as usize;
        let l4_offset = header.l4_offset as usize;
        let old_total_len = u16::from_be_bytes([header.buf()[ip_offset + 2], header.buf()[ip_offset + 3]]);

        plugin.on_packet(&mut header, acc, &store);

        let buf = header.buf();
        let flags = u16::from_be_bytes([buf[payload_offset + 2], buf[payload_offset + 3]]);
        assert_eq!(flags & 0x000f, 3, "rcode must be NXDOMAIN (3)");
        assert_eq!(u16::from_be_bytes([buf[payload_offset + 6], buf[payload_offset + 7]]), 0, "ancount");
        assert_eq!(u16::from_be_bytes([buf[payload_offset + 8], buf[payload_offset + 9]]), 0, "nscount");
        assert_eq!(u16::from_be_bytes([buf[payload_offset + 10], buf[payload_offset + 11]]), 0, "arcount");

        let new_total_len = u16::from_be_bytes([buf[ip_offset + 2], buf[ip_offset + 3]]);
        let new_udp_len = u16::from_be_bytes([buf[l4_offset + 4], buf[l4_offset + 5]]);
        assert!(new_total_len < old_total_len, "total length must shrink past the dropped answer");
        assert_eq!(new_udp_len as usize, new_total_len as usize - 20);
    }

    #[test]
    fn redirect_rewrites_answer_address_and_ttl() {
        let payload = query_response(Ipv4Addr::new(1, 2, 3, 4), 300);
        let mut pkt = build_packet(&payload);

        let policy = Arc::new(PolicyEngine::new());
        policy.update_table(redirect_table("www.example.com", "9.9.9.9", 30));
        let cache = Arc::new(VerdictCache::new());
        let plugin = DnsPlugin::new(policy, cache, "lan", [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);

        let store = AccumulatorStore::new(Duration::from_secs(60));
        let acc = dummy_handle(&store);

        let mut header = NetHeader::parse(&mut pkt, dpi_common::header::IngressSource::Socket).unwrap().unwrap();

        plugin.on_packet(&mut header, acc, &store);

        let parsed = parse_dns(header.payload()).unwrap();
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.answers[0].address, IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)));
        let ttl_bytes: [u8; 4] =
            header.payload()[parsed.answers[0].ttl_offset..parsed.answers[0].ttl_offset + 4].try_into().unwrap();
        assert_eq!(u32::from_be_bytes(ttl_bytes), 30);
    }
}
