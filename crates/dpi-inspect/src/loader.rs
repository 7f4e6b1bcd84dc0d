//! Object/signature loader (C10, §4.2/§6). Finds the best installed
//! signature bundle, loads it into the [`SignatureEngine`], subscribes
//! attribute callbacks, and hot-swaps to a newer version on update.
//!
//! Grounded on `sase-ips::compiler::RuleCompiler`'s `ArcSwap`-backed
//! hot-swappable database (same "compile once, publish atomically" shape,
//! here applied to signature bundle version strings instead of compiled
//! Hyperscan databases).

use crate::signature::{AttributeCallback, Signature, SignatureEngine};
use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// `major.minor.micro` signature bundle version (§6 "Version comparison").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BundleVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl BundleVersion {
    /// Parse a `major.minor.micro` string; any failure returns the zero
    /// version, which compares equal to itself (§6: "parse failure returns
    /// equal").
    pub fn parse(text: &str) -> Self {
        let mut parts = text.trim().split('.');
        let major = parts.next().and_then(|p| p.parse().ok());
        let minor = parts.next().and_then(|p| p.parse().ok());
        let micro = parts.next().and_then(|p| p.parse().ok());
        match (major, minor, micro) {
            (Some(major), Some(minor), Some(micro)) => Self { major, minor, micro },
            _ => Self::default(),
        }
    }
}

/// The two on-disk layouts §6 recognizes for a signature bundle.
#[derive(Debug, Clone)]
pub enum BundleSource {
    /// A plain `signature.bin` under the versioned store.
    Plain(PathBuf),
    /// A `data.tar.gz` already extracted to `/tmp/walleye`.
    Extracted(PathBuf),
}

impl BundleSource {
    pub fn path(&self) -> &Path {
        match self {
            BundleSource::Plain(p) | BundleSource::Extracted(p) => p,
        }
    }
}

/// Find the best installed bundle under a versioned store root (§6): the
/// highest-versioned directory containing either `signature.bin` directly,
/// or whose `/tmp/walleye` extraction target already exists.
pub fn find_best_bundle(store_root: &Path) -> Option<(BundleVersion, BundleSource)> {
    let entries = std::fs::read_dir(store_root).ok()?;
    let mut best: Option<(BundleVersion, BundleSource)> = None;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        let version = BundleVersion::parse(name);

        let plain = path.join("signature.bin");
        let extracted = PathBuf::from("/tmp/walleye").join("signature.bin");
        let source = if plain.exists() {
            BundleSource::Plain(plain)
        } else if path.join("data.tar.gz").exists() && extracted.exists() {
            BundleSource::Extracted(extracted)
        } else {
            continue;
        };

        let better = match &best {
            Some((current, _)) => {
                (version.major, version.minor, version.micro) > (current.major, current.minor, current.micro)
            }
            None => true,
        };
        if better {
            best = Some((version, source));
        }
    }
    best
}

/// Parse the bundle's signature list. The wire layout of `signature.bin`
/// itself is the pattern engine's black box (§1); this loader only needs
/// to hand the engine a `Vec<Signature>`, which in this tree is a
/// line-oriented `pattern|service_id|tag_id,tag_id,...` text stand-in for
/// that binary format.
fn parse_signatures(bytes: &[u8]) -> Vec<Signature> {
    let text = String::from_utf8_lossy(bytes);
    let mut signatures = Vec::new();
    for line in text.lines() {
        let mut fields = line.splitn(3, '|');
        let Some(pattern) = fields.next() else { continue };
        let Some(service_id) = fields.next().and_then(|s| s.parse::<u16>().ok()) else { continue };
        let tag_ids = fields
            .next()
            .map(|s| s.split(',').filter_map(|t| t.trim().parse::<u16>().ok()).collect())
            .unwrap_or_default();
        signatures.push(Signature { pattern: pattern.to_string(), service_id, tag_ids });
    }
    signatures
}

/// Owns the currently loaded bundle version and swaps the engine's ruleset
/// atomically when a newer one appears (C10, §4.2 `load`).
pub struct SignatureLoader {
    engine: Arc<SignatureEngine>,
    current: ArcSwap<BundleVersion>,
}

impl SignatureLoader {
    pub fn new(engine: Arc<SignatureEngine>) -> Self {
        Self { engine, current: ArcSwap::new(Arc::new(BundleVersion::default())) }
    }

    pub fn current_version(&self) -> BundleVersion {
        *self.current.load_full()
    }

    /// Subscribe an attribute callback under `key` (§4.2 `subscribe`).
    pub fn subscribe(&self, key: impl Into<String>, callback: AttributeCallback) {
        self.engine.subscribe(key.into(), callback);
    }

    /// Scan `store_root` for the best bundle and load it if its version is
    /// newer than what's currently active. Returns `true` if a swap happened.
    pub fn refresh(&self, store_root: &Path) -> bool {
        let Some((version, source)) = find_best_bundle(store_root) else {
            return false;
        };
        let current = self.current_version();
        if (version.major, version.minor, version.micro)
            <= (current.major, current.minor, current.micro)
        {
            return false;
        }
        let Ok(bytes) = std::fs::read(source.path()) else {
            return false;
        };
        let signatures = parse_signatures(&bytes);
        self.engine.load(signatures);
        self.current.store(Arc::new(version));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parses_major_minor_micro() {
        assert_eq!(BundleVersion::parse("3.2.1"), BundleVersion { major: 3, minor: 2, micro: 1 });
    }

    #[test]
    fn version_parse_failure_is_zero() {
        assert_eq!(BundleVersion::parse("not-a-version"), BundleVersion::default());
    }

    #[test]
    fn parses_signature_text() {
        let sigs = parse_signatures(b"malware|5|10,11\nother|6|\n");
        assert_eq!(sigs.len(), 2);
        assert_eq!(sigs[0].service_id, 5);
        assert_eq!(sigs[0].tag_ids, vec![10, 11]);
        assert!(sigs[1].tag_ids.is_empty());
    }

    #[test]
    fn finds_highest_versioned_bundle_with_signature_bin() {
        let dir = std::env::temp_dir().join(format!("dpi-loader-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("1.0.0")).unwrap();
        std::fs::write(dir.join("1.0.0").join("signature.bin"), b"a|1|\n").unwrap();
        std::fs::create_dir_all(dir.join("2.1.0")).unwrap();
        std::fs::write(dir.join("2.1.0").join("signature.bin"), b"b|2|\n").unwrap();

        let (version, source) = find_best_bundle(&dir).unwrap();
        assert_eq!(version, BundleVersion { major: 2, minor: 1, micro: 0 });
        assert!(source.path().ends_with("signature.bin"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
