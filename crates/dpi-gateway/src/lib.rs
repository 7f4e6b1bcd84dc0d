//! Gateway wiring: `DpiWorld` construction, configuration, and the
//! single-threaded cooperative ingress loop (§5, §9 Design Notes).

pub mod config;
pub mod run;
pub mod world;

pub use config::GatewayConfig;
pub use world::DpiWorld;
