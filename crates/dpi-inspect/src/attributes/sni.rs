//! SNI/HOST/URL plugin (§4.6). Extracts `tls.sni`, `http.host`, `http.url`
//! and dispatches a `PolicyRequest` for each, with a redirect-cache
//! short-circuit for the http attributes.
//!
//! TLS ClientHello SNI extraction is grounded on
//! `sase-ips::protocols::tls::TlsAnalyzer::parse_client_hello`, rewritten
//! against the extension-walking shape only (JA3 fingerprinting has no
//! counterpart here). HTTP host/url parsing is grounded on
//! `sase-ips::protocols::http::HttpAnalyzer::parse_request`.

use dpi_common::header::NetHeader;
use dpi_dataplane::{AccHandle, AccumulatorStore, DpiPlugin, PluginDecision};
use dpi_policy::cache::{AttributeType, Direction as CacheDirection, VerdictCache};
use dpi_policy::engine::PolicyEngine;
use dpi_policy::request::{PolicyRequest, ReqType};
use dpi_policy::rule::PolicyAction;
use std::sync::Arc;

pub const SNI_HOST_URL_PLUGIN_ID: u32 = 600;

const TLS_HANDSHAKE: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0;

/// Walk a TLS ClientHello record looking for the SNI extension (extension
/// type 0, host_name entry).
fn extract_sni(payload: &[u8]) -> Option<String> {
    if payload.len() < 6 || payload[0] != TLS_HANDSHAKE {
        return None;
    }
    let mut off = 5; // record header
    if payload.get(off)? != &CLIENT_HELLO {
        return None;
    }
    off += 4; // handshake type + 24-bit length
    off += 2; // client_version
    off += 32; // random
    let session_len = *payload.get(off)? as usize;
    off += 1 + session_len;
    let cipher_len = u16::from_be_bytes([*payload.get(off)?, *payload.get(off + 1)?]) as usize;
    off += 2 + cipher_len;
    let compression_len = *payload.get(off)? as usize;
    off += 1 + compression_len;
    let extensions_len = u16::from_be_bytes([*payload.get(off)?, *payload.get(off + 1)?]) as usize;
    off += 2;
    let extensions_end = off + extensions_len;

    while off + 4 <= extensions_end.min(payload.len()) {
        let ext_type = u16::from_be_bytes([payload[off], payload[off + 1]]);
        let ext_len = u16::from_be_bytes([payload[off + 2], payload[off + 3]]) as usize;
        let ext_start = off + 4;
        if ext_type == EXT_SERVER_NAME {
            // server_name_list: 2-byte list len, then (1-byte type, 2-byte len, name)...
            let list_start = ext_start + 2;
            if payload.len() >= list_start + 3 {
                let name_len = u16::from_be_bytes([payload[list_start + 1], payload[list_start + 2]]) as usize;
                let name_start = list_start + 3;
                let name_end = name_start + name_len;
                return payload.get(name_start..name_end).map(|b| String::from_utf8_lossy(b).to_string());
            }
        }
        off = ext_start + ext_len;
    }
    None
}

struct HttpRequest {
    host: Option<String>,
    url: Option<String>,
}

/// Parse just enough of an HTTP/1.x request to pull `Host:` and the
/// request-line path out of the first few header lines.
fn parse_http(payload: &[u8]) -> Option<HttpRequest> {
    let text = std::str::from_utf8(payload).ok()?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?;
    if !matches!(method, "GET" | "POST" | "HEAD" | "PUT" | "DELETE" | "OPTIONS") {
        return None;
    }
    let path = parts.next().map(|s| s.to_string());

    let mut host = None;
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            if key.eq_ignore_ascii_case("host") {
                host = Some(value.trim().to_string());
            }
        }
    }

    let url = match (&host, &path) {
        (Some(h), Some(p)) => Some(format!("http://{h}{p}")),
        _ => None,
    };
    Some(HttpRequest { host, url })
}

/// Extract the FQDN between `http://` and the next `/` (§4.6 `http.url`).
fn fqdn_from_url(url: &str) -> Option<String> {
    let rest = url.strip_prefix("http://")?;
    let end = rest.find('/').unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

pub struct SniHostUrlPlugin {
    policy: Arc<PolicyEngine>,
    cache: Arc<VerdictCache>,
    table_name: String,
    report_sink: Option<dpi_report::ReportSink>,
}

impl SniHostUrlPlugin {
    pub fn new(policy: Arc<PolicyEngine>, cache: Arc<VerdictCache>, table_name: impl Into<String>) -> Self {
        Self { policy, cache, table_name: table_name.into(), report_sink: None }
    }

    pub fn with_report_sink(mut self, sink: dpi_report::ReportSink) -> Self {
        self.report_sink = Some(sink);
        self
    }

    fn maybe_report(&self, device_mac: [u8; 6], value: &str, reply: &dpi_policy::request::PolicyReply) {
        let Some(sink) = &self.report_sink else { return };
        if !reply.to_report {
            return;
        }
        let timestamp_ms =
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0);
        sink.emit_url(&dpi_report::UrlReport {
            device_id: mac_string(device_mac),
            url: value.to_string(),
            action: reply.log_action.clone(),
            rule_name: reply.rule_name.clone(),
            policy_name: reply.policy_name.clone(),
            timestamp_ms,
            categories: None,
            risk_level: reply.risk_level,
        });
    }

    fn dispatch(&self, req_type: ReqType, device_mac: [u8; 6], value: String, dest: std::net::IpAddr) -> PluginDecision {
        if self.cache.is_redirected_flow(device_mac, dest, CacheDirection::Outbound) {
            // Already redirected at the IP layer; don't re-evaluate here (§4.6).
            return PluginDecision::Passthru;
        }

        let attribute_type = match req_type {
            ReqType::Sni => AttributeType::Sni,
            ReqType::Host => AttributeType::Host,
            ReqType::Url => AttributeType::Url,
            _ => AttributeType::Fqdn,
        };
        if let Some(cached) = self.cache.lookup_gatekeeper(device_mac, attribute_type, &value) {
            return decision_for(cached.action);
        }

        let mut req = PolicyRequest::new(req_type, device_mac);
        req.url = Some(value.clone());
        let reply = self.policy.apply(&self.table_name, &req);
        self.maybe_report(device_mac, &value, &reply);
        decision_for(reply.action)
    }
}

fn mac_string(mac: [u8; 6]) -> String {
    format!("{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", mac[0], mac[1], mac[2], mac[3], mac[4], mac[5])
}

fn decision_for(action: PolicyAction) -> PluginDecision {
    match action {
        PolicyAction::Block => PluginDecision::Drop,
        _ => PluginDecision::Passthru,
    }
}

impl DpiPlugin for SniHostUrlPlugin {
    fn id(&self) -> u32 {
        SNI_HOST_URL_PLUGIN_ID
    }

    fn name(&self) -> &'static str {
        "sni_host_url"
    }

    fn on_packet(&self, header: &mut NetHeader<'_>, _acc: AccHandle, _store: &AccumulatorStore) -> PluginDecision {
        let Some(key) = header.flow_key else {
            return PluginDecision::Passthru;
        };
        let payload = header.payload();

        if header.ip_protocol == 6 {
            if let Some(sni) = extract_sni(payload) {
                return self.dispatch(ReqType::Sni, key.smac, sni, key.dip);
            }
            if let Some(http) = parse_http(payload) {
                if let Some(url) = &http.url {
                    if let Some(fqdn) = fqdn_from_url(url) {
                        let _ = self.dispatch(ReqType::Host, key.smac, fqdn, key.dip);
                    }
                    return self.dispatch(ReqType::Url, key.smac, url.clone(), key.dip);
                }
                if let Some(host) = http.host {
                    return self.dispatch(ReqType::Host, key.smac, host, key.dip);
                }
            }
        }

        PluginDecision::Passthru
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello_with_sni(name: &str) -> Vec<u8> {
        let mut sni_ext = vec![0u8, name.len() as u8 + 3];
        sni_ext.push(0); // server name type = host_name
        sni_ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(name.as_bytes());

        let mut ext = vec![0u8, 0u8]; // extension type = server_name
        ext.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        ext.extend_from_slice(&sni_ext);

        let mut hello = vec![0u8; 2]; // client_version
        hello.extend_from_slice(&[0u8; 32]); // random
        hello.push(0); // session id len
        hello.extend_from_slice(&[0, 2, 0, 0x2f]); // cipher suites (len=2, one suite)
        hello.push(1); // compression methods len
        hello.push(0); // null compression
        hello.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        hello.extend_from_slice(&ext);

        let mut handshake = vec![CLIENT_HELLO];
        let len = hello.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello);

        let mut record = vec![TLS_HANDSHAKE, 3, 3];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_from_client_hello() {
        let record = client_hello_with_sni("example.com");
        assert_eq!(extract_sni(&record), Some("example.com".to_string()));
    }

    #[test]
    fn parses_http_host_and_url() {
        let req = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nUser-Agent: x\r\n\r\n";
        let parsed = parse_http(req).unwrap();
        assert_eq!(parsed.host, Some("example.com".to_string()));
        assert_eq!(parsed.url, Some("http://example.com/index.html".to_string()));
    }

    #[test]
    fn extracts_fqdn_from_url() {
        assert_eq!(fqdn_from_url("http://example.com/index.html"), Some("example.com".to_string()));
    }
}
