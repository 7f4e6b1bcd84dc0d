//! Error types shared across the DPI pipeline.
//!
//! Every variant here is non-fatal to the dispatch loop: callers map a
//! `DpiError` to a local `passthru`/`drop`/`ignored` outcome rather than
//! propagating it (see §7 of the design: "errors never escape the loop").

use thiserror::Error;

/// Shared error type for header parsing, checksum fixups, and plugin I/O.
#[derive(Error, Debug)]
pub enum DpiError {
    /// Buffer shorter than the header it is claimed to hold.
    #[error("truncated packet: need {need} bytes, have {have}")]
    Truncated {
        /// Minimum bytes required to continue parsing.
        need: usize,
        /// Bytes actually available.
        have: usize,
    },

    /// Ethertype other than IPv4/IPv6.
    #[error("unsupported ethertype: {0:#06x}")]
    UnsupportedEtherType(u16),

    /// Malformed IPv4 header (bad IHL, short total length, ...).
    #[error("invalid ipv4 header: {0}")]
    InvalidIpv4(&'static str),

    /// Malformed IPv6 header.
    #[error("invalid ipv6 header: {0}")]
    InvalidIpv6(&'static str),

    /// The signature engine refused to create a stream (sandbox full).
    #[error("classifier stream create failed")]
    ClassifierCreate,

    /// The signature engine returned a fatal scan error.
    #[error("classifier scan error")]
    ClassifierScan,

    /// A flow was torn down with a classification still in flight.
    #[error("classifier torn down before classification completed")]
    ClassifierIncomplete,

    /// Policy table referenced by name does not exist.
    #[error("policy table not found: {0}")]
    PolicyTableNotFound(String),

    /// Underlying I/O failure (socket, file, nfqueue).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration value could not be parsed or applied live.
    #[error("config error: {0}")]
    Config(String),
}

/// Result type used throughout the core.
pub type DpiResult<T> = Result<T, DpiError>;
