//! Signature engine contract (C5 depends on, §4.2).
//!
//! Grounded on `sase-ips::engine::IpsEngine`'s aho-corasick fallback path
//! (`simple_match`) for the actual matching technique, but restructured
//! away from that engine's single-shot `inspect(data) -> InspectionResult`
//! API towards the spec's incremental per-flow stream contract: callers
//! open a `Stream` once per flow and feed it packets as they arrive,
//! rather than handing over one whole buffer.
//!
//! The Hyperscan/Suricata-rule compilation pipeline `sase-ips` built
//! (`compiler.rs`, `parser.rs`) has no counterpart here — see DESIGN.md.

use aho_corasick::AhoCorasick;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Engine-level handle, created once per process (§4.2 `handle_create`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

/// Per-flow scanning handle (§4.2 `stream_create`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stream(u64);

/// Direction of a scanned byte range, client (0) or server (1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Client = 0,
    Server = 1,
}

/// An attribute emitted by the engine to a subscribed callback (§4.2, §4.5).
#[derive(Debug, Clone)]
pub struct Attribute {
    pub key: String,
    pub value: AttributeValue,
}

#[derive(Debug, Clone)]
pub enum AttributeValue {
    Str(String),
    U64(u64),
    Bytes(Vec<u8>),
}

/// Callback registered via `subscribe` (§4.2). `user` is the opaque pointer
/// the core associates with the stream (the accumulator handle, packed).
pub type AttributeCallback = Arc<dyn Fn(u64, &Attribute) + Send + Sync>;

/// One loaded signature/literal pattern, with the `service_id`/tag ids the
/// `Matched` state resolves via `lookup` (§4.2, §4.5).
#[derive(Debug, Clone)]
pub struct Signature {
    pub pattern: String,
    pub service_id: u16,
    pub tag_ids: Vec<u16>,
}

/// A loaded ruleset, atomically swappable by `load` (§4.2, §5 "handle swap
/// is atomic").
struct Ruleset {
    automaton: Option<AhoCorasick>,
    signatures: Vec<Signature>,
    names: DashMap<u16, String>,
}

impl Ruleset {
    fn empty() -> Self {
        Self { automaton: None, signatures: Vec::new(), names: DashMap::new() }
    }

    fn from_signatures(signatures: Vec<Signature>) -> Self {
        let patterns: Vec<&str> = signatures.iter().map(|s| s.pattern.as_str()).collect();
        let automaton = AhoCorasick::new(&patterns).ok();
        let names = DashMap::new();
        for sig in &signatures {
            names.insert(sig.service_id, sig.pattern.clone());
            for t in &sig.tag_ids {
                names.entry(*t).or_insert_with(|| format!("tag-{t}"));
            }
        }
        Self { automaton, signatures, names }
    }
}

struct StreamState {
    domain: IpAddr,
    proto: u8,
    src_ip: IpAddr,
    src_port: u16,
    dst_ip: IpAddr,
    dst_port: u16,
    user: u64,
    matched: Option<Signature>,
    bytes_scanned: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("stream creation refused: sandbox memory exhausted")]
    SandboxFull,
    #[error("unknown stream")]
    UnknownStream,
}

/// Aho-Corasick-backed implementation of the §4.2 black-box contract.
///
/// One `SignatureEngine` is created per `Handle`; `sandbox_limit` bounds the
/// number of concurrently open streams, standing in for the engine's
/// configurable memory sandbox (§5 `rts_handle_memory_size`).
pub struct SignatureEngine {
    ruleset: RwLock<Arc<Ruleset>>,
    streams: DashMap<u64, StreamState>,
    subscribers: DashMap<String, AttributeCallback>,
    next_stream_id: AtomicU64,
    sandbox_limit: usize,
}

impl SignatureEngine {
    pub fn handle_create(sandbox_limit: usize) -> (Handle, Arc<Self>) {
        static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
        let engine = Arc::new(Self {
            ruleset: RwLock::new(Arc::new(Ruleset::empty())),
            streams: DashMap::new(),
            subscribers: DashMap::new(),
            next_stream_id: AtomicU64::new(1),
            sandbox_limit,
        });
        (Handle(id), engine)
    }

    pub fn handle_destroy(&self) {
        self.streams.clear();
        self.subscribers.clear();
    }

    /// Atomically replace the active ruleset (§4.2 `load`).
    pub fn load(&self, signatures: Vec<Signature>) {
        let fresh = Arc::new(Ruleset::from_signatures(signatures));
        *self.ruleset.write().unwrap() = fresh;
    }

    pub fn subscribe(&self, key: impl Into<String>, callback: AttributeCallback) {
        self.subscribers.insert(key.into(), callback);
    }

    pub fn unsubscribe(&self, key: &str) {
        self.subscribers.remove(key);
    }

    fn emit(&self, user: u64, key: &str, value: AttributeValue) {
        if let Some(cb) = self.subscribers.get(key) {
            cb(user, &Attribute { key: key.to_string(), value });
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn stream_create(
        &self,
        domain: IpAddr,
        proto: u8,
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        user: u64,
    ) -> Result<Stream, EngineError> {
        if self.streams.len() >= self.sandbox_limit {
            return Err(EngineError::SandboxFull);
        }
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        self.streams.insert(
            id,
            StreamState { domain, proto, src_ip, src_port, dst_ip, dst_port, user, matched: None, bytes_scanned: 0 },
        );
        Ok(Stream(id))
    }

    /// Feed one packet's payload to the stream. Returns `Ok(true)` while
    /// more packets are needed, `Ok(false)` once classification is
    /// terminal, or `Err` on a fatal scan error (§4.2).
    pub fn stream_scan(
        &self,
        stream: Stream,
        bytes: &[u8],
        _direction: ScanDirection,
        _ts_ms: u64,
    ) -> Result<bool, EngineError> {
        let mut entry = self.streams.get_mut(&stream.0).ok_or(EngineError::UnknownStream)?;
        entry.bytes_scanned += bytes.len() as u64;

        let ruleset = self.ruleset.read().unwrap().clone();
        if entry.matched.is_none() {
            if let Some(ac) = &ruleset.automaton {
                if let Some(m) = ac.find(bytes) {
                    entry.matched = ruleset.signatures.get(m.pattern().as_usize()).cloned();
                }
            }
        }

        if let Some(sig) = entry.matched.clone() {
            let user = entry.user;
            drop(entry);
            self.emit(user, "service.application", AttributeValue::Str(sig.pattern.clone()));
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// `stream_matching` (§4.2): non-zero while more packets are needed.
    pub fn stream_matching(&self, stream: Stream) -> i32 {
        match self.streams.get(&stream.0) {
            Some(s) if s.matched.is_some() => 0,
            Some(_) => 1,
            None => 0,
        }
    }

    pub fn stream_destroy(&self, stream: Stream) {
        self.streams.remove(&stream.0);
    }

    /// Resolve a service/tag id to its human-readable name.
    pub fn lookup(&self, service_id: u16) -> Option<String> {
        self.ruleset.read().unwrap().names.get(&service_id).map(|n| n.clone())
    }

    pub fn matched_signature(&self, stream: Stream) -> Option<Signature> {
        self.streams.get(&stream.0).and_then(|s| s.matched.clone())
    }

    pub fn bytes_scanned(&self, stream: Stream) -> u64 {
        self.streams.get(&stream.0).map(|s| s.bytes_scanned).unwrap_or(0)
    }

    pub fn stream_endpoints(&self, stream: Stream) -> Option<(IpAddr, u16, IpAddr, u16)> {
        self.streams.get(&stream.0).map(|s| (s.src_ip, s.src_port, s.dst_ip, s.dst_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(pattern: &str, service_id: u16) -> Signature {
        Signature { pattern: pattern.to_string(), service_id, tag_ids: vec![] }
    }

    #[test]
    fn scans_until_match_then_terminal() {
        let (_h, engine) = SignatureEngine::handle_create(16);
        engine.load(vec![sig("malware", 1001)]);

        let stream = engine
            .stream_create(
                "10.0.0.1".parse().unwrap(),
                6,
                "10.0.0.1".parse().unwrap(),
                1234,
                "93.184.216.34".parse().unwrap(),
                443,
                42,
            )
            .unwrap();

        let more = engine.stream_scan(stream, b"GET /clean.html", ScanDirection::Client, 0).unwrap();
        assert!(more);
        assert_eq!(engine.stream_matching(stream), 1);

        let more = engine.stream_scan(stream, b"downloading malware.exe", ScanDirection::Client, 1).unwrap();
        assert!(!more);
        assert_eq!(engine.stream_matching(stream), 0);

        engine.stream_destroy(stream);
    }

    #[test]
    fn sandbox_limit_refuses_stream() {
        let (_h, engine) = SignatureEngine::handle_create(1);
        let make = || {
            engine.stream_create(
                "10.0.0.1".parse().unwrap(),
                6,
                "10.0.0.1".parse().unwrap(),
                1,
                "10.0.0.2".parse().unwrap(),
                2,
                0,
            )
        };
        assert!(make().is_ok());
        assert!(matches!(make(), Err(EngineError::SandboxFull)));
    }

    #[test]
    fn lookup_resolves_service_name() {
        let (_h, engine) = SignatureEngine::handle_create(16);
        engine.load(vec![sig("bittorrent", 77)]);
        assert_eq!(engine.lookup(77).as_deref(), Some("bittorrent"));
        assert_eq!(engine.lookup(999), None);
    }
}
