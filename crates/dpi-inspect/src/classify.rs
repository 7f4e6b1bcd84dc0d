//! Signature plugin (C5, §4.5): the `ClassifierConnection` state machine
//! wired to the [`crate::signature::SignatureEngine`] black-box contract
//! and bound into the dispatcher as a [`DpiPlugin`].
//!
//! Grounded on `sase-ips::engine::IpsEngine::inspect`'s match/verdict
//! shape, generalized from one-shot inspection to the per-flow
//! New/Scanning/Matched progression the accumulator store requires.

use crate::signature::{ScanDirection, Signature, SignatureEngine, Stream};
use dashmap::DashMap;
use dpi_common::flow::FlowTag;
use dpi_common::header::NetHeader;
use dpi_dataplane::{AccHandle, AccumulatorStore, DpiPlugin, PluginDecision};
use std::sync::Arc;
use std::time::Instant;

/// `ClassifierConnection` lifecycle (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    New,
    Scanning,
    Matched,
    ErrCreate,
    ErrScan,
    ErrIncomplete,
}

struct Connection {
    state: ConnState,
    stream: Option<Stream>,
    client_mac: [u8; 6],
    created: Instant,
    pkts_scanned: u64,
}

/// `app_check` result: whether the resolved application should be dropped
/// and whether the flow should be tagged for reporting (§4.5 step 3-4).
pub trait AppCheck: Send + Sync {
    fn check(&self, service_name: &str) -> AppVerdict;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AppVerdict {
    pub drop: bool,
    pub tag_flow: bool,
}

/// No-op app check: never drops, always tags (useful as a default and in tests).
pub struct AlwaysTag;
impl AppCheck for AlwaysTag {
    fn check(&self, _service_name: &str) -> AppVerdict {
        AppVerdict { drop: false, tag_flow: true }
    }
}

pub const SIGNATURE_PLUGIN_ID: u32 = 100;

pub struct SignaturePlugin {
    engine: Arc<SignatureEngine>,
    app_check: Arc<dyn AppCheck>,
    connections: DashMap<AccHandle, Connection>,
}

impl SignaturePlugin {
    pub fn new(engine: Arc<SignatureEngine>, app_check: Arc<dyn AppCheck>) -> Self {
        Self { engine, app_check, connections: DashMap::new() }
    }

    pub fn load(&self, signatures: Vec<Signature>) {
        self.engine.load(signatures);
    }

    /// Per-flow-info free hook (§3/§4.3 destruction order): destroys any
    /// stream still open at teardown, marking it `err_incomplete`.
    pub fn free_flow(&self, handle: AccHandle) {
        if let Some((_, mut conn)) = self.connections.remove(&handle) {
            if let Some(stream) = conn.stream.take() {
                self.engine.stream_destroy(stream);
                conn.state = ConnState::ErrIncomplete;
            }
        }
    }

    fn direction(client_mac: [u8; 6], smac: [u8; 6]) -> ScanDirection {
        if smac == client_mac {
            ScanDirection::Client
        } else {
            ScanDirection::Server
        }
    }

    /// Transition `Matched`: resolve names, run the app check, build the
    /// `FlowTag`, and return the dispatcher-visible decision (§4.5 step 3-5).
    fn finish_match(&self, handle: AccHandle, conn: &mut Connection, store: &AccumulatorStore) -> PluginDecision {
        let stream = match conn.stream {
            Some(s) => s,
            None => return PluginDecision::Passthru,
        };
        let sig = self.engine.matched_signature(stream);
        let service_name = sig
            .as_ref()
            .and_then(|s| self.engine.lookup(s.service_id))
            .unwrap_or_else(|| "unknown".to_string());
        let tags: Vec<String> = sig
            .as_ref()
            .map(|s| s.tag_ids.iter().filter(|t| **t != s.service_id).filter_map(|t| self.engine.lookup(*t)).collect())
            .unwrap_or_default();

        let verdict = self.app_check.check(&service_name);

        if verdict.tag_flow {
            let tag = FlowTag {
                vendor: "Walleye".to_string(),
                app_name: service_name.clone(),
                tags,
                tol_ms: conn.created.elapsed().as_millis() as u64,
                pkts_scanned: conn.pkts_scanned,
                diagnostic: None,
                server_name: None,
                scan_error: None,
            };
            store.with_mut(handle, |acc| acc.report_tag = Some(tag));
        }

        self.engine.stream_destroy(stream);
        conn.stream = None;
        conn.state = ConnState::Matched;

        if verdict.drop {
            PluginDecision::Drop
        } else {
            PluginDecision::Passthru
        }
    }
}

impl DpiPlugin for SignaturePlugin {
    fn id(&self) -> u32 {
        SIGNATURE_PLUGIN_ID
    }

    fn name(&self) -> &'static str {
        "signature"
    }

    fn on_packet(&self, header: &mut NetHeader<'_>, acc: AccHandle, store: &AccumulatorStore) -> PluginDecision {
        let Some(key) = header.flow_key else {
            return PluginDecision::Passthru;
        };

        let mut conn = self.connections.entry(acc).or_insert_with(|| Connection {
            state: ConnState::New,
            stream: None,
            client_mac: key.smac,
            created: Instant::now(),
            pkts_scanned: 0,
        });

        if conn.state == ConnState::New {
            match self.engine.stream_create(key.sip, key.protocol, key.sip, key.sport, key.dip, key.dport, acc.pack())
            {
                Ok(stream) => {
                    conn.stream = Some(stream);
                    conn.state = ConnState::Scanning;
                }
                Err(_) => {
                    conn.state = ConnState::ErrCreate;
                    return PluginDecision::Passthru;
                }
            }
        }

        match conn.state {
            ConnState::Scanning => {
                let Some(stream) = conn.stream else {
                    return PluginDecision::Passthru;
                };
                let direction = Self::direction(conn.client_mac, key.smac);
                conn.pkts_scanned += 1;
                match self.engine.stream_scan(stream, header.payload(), direction, 0) {
                    Ok(true) => PluginDecision::Inspect,
                    Ok(false) => self.finish_match(acc, &mut conn, store),
                    Err(_) => {
                        conn.state = ConnState::ErrScan;
                        PluginDecision::Passthru
                    }
                }
            }
            ConnState::Matched => PluginDecision::Passthru,
            ConnState::ErrCreate | ConnState::ErrScan | ConnState::ErrIncomplete => PluginDecision::Passthru,
            ConnState::New => unreachable!("handled above"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Signature;
    use dpi_common::flow::{FlowKey, IpVersion};
    use dpi_common::header::IngressSource;
    use std::time::Duration;

    fn sample_header(buf: &mut [u8]) -> NetHeader<'_> {
        buf[12] = 0x08;
        buf[13] = 0x00;
        buf[14] = 0x45;
        buf[16] = 0x00;
        buf[17] = 54;
        buf[23] = 6;
        NetHeader::parse(buf, IngressSource::Socket).unwrap().unwrap()
    }

    #[test]
    fn new_stream_then_match_tags_flow() {
        let (_h, engine) = SignatureEngine::handle_create(16);
        engine.load(vec![Signature { pattern: "malware".to_string(), service_id: 5, tag_ids: vec![] }]);
        let plugin = SignaturePlugin::new(engine, Arc::new(AlwaysTag));

        let store = AccumulatorStore::new(Duration::from_secs(60));
        let key = FlowKey {
            smac: [0; 6],
            dmac: [1; 6],
            vlan: 0,
            ethertype: 0x0800,
            ip_version: IpVersion::V4,
            protocol: 6,
            sip: "10.0.0.1".parse().unwrap(),
            dip: "10.0.0.2".parse().unwrap(),
            sport: 1,
            dport: 443,
            icmp_id: None,
        };
        let acc = store.insert(key);

        let mut buf = vec![0u8; 54 + 14];
        let mut header = sample_header(&mut buf[..54]);
        let decision = plugin.on_packet(&mut header, acc, &store);
        assert_eq!(decision, PluginDecision::Inspect);

        let mut buf2 = b"downloading malware.exe payload".to_vec();
        buf2.resize(54, 0);
        let mut header2 = sample_header(&mut buf2);
        let decision2 = plugin.on_packet(&mut header2, acc, &store);
        assert_eq!(decision2, PluginDecision::Passthru);

        let tagged = store.with(acc, |a| a.report_tag.is_some()).unwrap();
        assert!(tagged);
    }
}
