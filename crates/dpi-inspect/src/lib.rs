//! Signature classification and attribute-client plugins (C5/C6/C10).
//!
//! Wires the black-box [`signature`] engine contract into a
//! [`DpiPlugin`](dpi_dataplane::DpiPlugin)-conforming [`classify`] plugin,
//! the [`attributes`] plugins DNS/DHCP/mDNS/ARP-NDP/SNI-HOST-URL rely on,
//! and the [`loader`] that finds, loads, and hot-swaps signature bundles.

pub mod attributes;
pub mod classify;
pub mod loader;
pub mod signature;

pub use classify::{AppCheck, AppVerdict, SignaturePlugin, SIGNATURE_PLUGIN_ID};
pub use loader::{BundleSource, BundleVersion, SignatureLoader};
pub use signature::{EngineError, Signature, SignatureEngine};

use thiserror::Error;

/// Crate-level errors surfaced outside the fail-open packet path (loader
/// and configuration failures only — per-packet errors are always
/// swallowed into a local `PluginDecision`, §7).
#[derive(Error, Debug)]
pub enum DpiInspectError {
    #[error("signature bundle io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no installed signature bundle found under {0}")]
    NoBundleFound(String),
}
