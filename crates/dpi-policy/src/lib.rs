//! Per-attribute policy engine (C7) and verdict caches (C8).
//!
//! ```text
//! PolicyRequest ──► PolicyEngine::apply ──► PolicyReply
//!                        │
//!                        ├─ TableStore (named, atomically swapped tables)
//!                        └─ CategoryProvider / GatekeeperProvider (external)
//!
//! VerdictCache: name cache, ip cache, unified gatekeeper cache
//! PendingRequests: dedup concurrent lookups for the same (device, qname)
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod engine;
pub mod request;
pub mod rule;
pub mod store;

pub use cache::{PendingRequests, VerdictCache};
pub use engine::PolicyEngine;
pub use request::{CategoryProvider, GatekeeperProvider, PolicyReply, PolicyRequest, ReqType};
pub use rule::{PolicyAction, PolicyRule, PolicyTable, TagResolver};
pub use store::{PolicyClient, TableStore};
