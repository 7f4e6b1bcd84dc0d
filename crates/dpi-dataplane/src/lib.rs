//! Flow accumulator store and DPI dispatcher (C3/C4).
//!
//! ```text
//! NetHeader ──► AccumulatorStore::lookup/insert ──► Dispatcher::dispatch
//!                                                         │
//!                                              ordered DpiPlugin fan-out
//!                                                         │
//!                                                      Verdict
//! ```

#![allow(dead_code)]

pub mod accumulator;
pub mod dispatch;
pub mod stats;

pub use accumulator::{AccHandle, Accumulator, AccumulatorStore, PluginDecision};
pub use dispatch::{DpiPlugin, Dispatcher, Targeting, Verdict};
pub use stats::DispatchStats;
