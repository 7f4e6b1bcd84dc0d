//! Gateway binary: loads the on-disk TOML gateway config (§6), builds a
//! [`dpi_gateway::DpiWorld`], and drives the ingress loop.

use dpi_gateway::{run::run_socket_loop, DpiWorld, GatewayConfig};
use tracing_subscriber::EnvFilter;

fn load_config() -> GatewayConfig {
    let Some(path) = std::env::args().nth(1) else {
        return GatewayConfig::default();
    };
    match std::fs::read_to_string(&path) {
        Ok(text) => GatewayConfig::from_toml(&text).unwrap_or_else(|err| {
            tracing::warn!(%err, path, "failed to parse config, using defaults");
            GatewayConfig::default()
        }),
        Err(err) => {
            tracing::warn!(%err, path, "failed to read config, using defaults");
            GatewayConfig::default()
        }
    }
}

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = load_config();
    let ingress_bind = config.ingress_bind;
    let gateway_mac = config.gateway_mac;

    let world = DpiWorld::new(config)?;
    let mut listener = dpi_ingress::socket::SocketListener::bind(ingress_bind, gateway_mac)?;

    tracing::info!(%ingress_bind, "dpi-gateway listening");
    run_socket_loop(&world, &mut listener)
}
