//! Attribute-client plugins (C6, §4.6).
//!
//! Each plugin here is a tiny `begin -> field... -> end` state machine that
//! assembles one record per flow/message and, on `end`, dispatches it
//! against the policy engine or a local table. A parse failure at any
//! field resets the machine and is treated as `ignored`, matching §4.6's
//! "stray attribute" rule.

pub mod dhcp;
pub mod dns;
pub mod mdns;
pub mod neighbor;
pub mod sni;

pub use dhcp::DhcpPlugin;
pub use dns::DnsPlugin;
pub use mdns::MdnsPlugin;
pub use neighbor::NeighborPlugin;
pub use sni::SniHostUrlPlugin;
