//! Gateway configuration (§6 "Configuration surface").
//!
//! `other_config` (§6) is a flat string→string map in the source interface;
//! here it is modeled as a TOML-deserializable [`GatewayConfig`] with typed
//! fields for every recognized key, plus an `other_config` escape hatch for
//! anything this struct doesn't give a stronger type, mirroring
//! `sase-dataplane::EngineConfig`'s config-struct-plus-catchall shape.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

fn default_policy_table() -> String {
    "default".to_string()
}
fn default_mqtt_topic() -> String {
    "dpi/session".to_string()
}
fn default_ttl_secs() -> u64 {
    300
}
fn default_health_topic() -> String {
    "dpi/health".to_string()
}
fn default_health_interval_secs() -> u64 {
    dpi_report::HEALTH_REPORT_INTERVAL_SECS
}
fn default_sandbox_size() -> usize {
    8192
}
fn default_cache_ip() -> bool {
    true
}
fn default_dpi_dispatcher() -> bool {
    true
}
fn default_ingress_bind() -> SocketAddr {
    "0.0.0.0:9999".parse().unwrap()
}
fn default_report_collector() -> SocketAddr {
    "127.0.0.1:5140".parse().unwrap()
}
fn default_gateway_mac() -> [u8; 6] {
    [0, 0, 0, 0, 0, 1]
}

/// Recognized `other_config` keys (§6), deserialized from the on-disk TOML
/// gateway config. Unknown keys land in [`Self::other_config`] rather than
/// failing deserialization, since the source treats this as an open map.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub provider_plugin: Option<String>,
    #[serde(default = "default_policy_table")]
    pub policy_table: String,
    #[serde(default = "default_mqtt_topic")]
    pub mqtt_topic: String,
    pub blocker_topic: Option<String>,
    pub targeted_devices: Vec<String>,
    pub excluded_devices: Vec<String>,
    #[serde(default = "default_dpi_dispatcher")]
    pub dpi_dispatcher: bool,
    pub queue_num: Option<String>,
    pub nfqueue_buff_size: Option<u32>,
    pub nfqueue_length: Option<u32>,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_health_topic")]
    pub dpi_health_stats_topic: String,
    #[serde(default = "default_health_interval_secs")]
    pub dpi_health_stats_interval_secs: u64,
    pub wc_health_stats_topic: Option<String>,
    pub wc_health_stats_interval_secs: Option<u64>,
    #[serde(default = "default_sandbox_size")]
    pub sandbox_size: usize,
    pub rts_dict_expiry_secs: Option<u64>,
    pub scan_dbg_en: bool,
    #[serde(default = "default_cache_ip")]
    pub cache_ip: bool,
    pub debug: bool,
    pub mdns_src_ip: Option<SocketAddr>,
    pub provider: Option<String>,
    #[serde(default = "default_ingress_bind")]
    pub ingress_bind: SocketAddr,
    #[serde(default = "default_gateway_mac")]
    pub gateway_mac: [u8; 6],
    #[serde(default = "default_report_collector")]
    pub report_collector: SocketAddr,
    /// Escape hatch for keys the source lists but this struct doesn't model
    /// more strongly (§6 "other_config is a map of string→string").
    pub other_config: BTreeMap<String, String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            provider_plugin: None,
            policy_table: default_policy_table(),
            mqtt_topic: default_mqtt_topic(),
            blocker_topic: None,
            targeted_devices: Vec::new(),
            excluded_devices: Vec::new(),
            dpi_dispatcher: default_dpi_dispatcher(),
            queue_num: None,
            nfqueue_buff_size: None,
            nfqueue_length: None,
            ttl_secs: default_ttl_secs(),
            dpi_health_stats_topic: default_health_topic(),
            dpi_health_stats_interval_secs: default_health_interval_secs(),
            wc_health_stats_topic: None,
            wc_health_stats_interval_secs: None,
            sandbox_size: default_sandbox_size(),
            rts_dict_expiry_secs: None,
            scan_dbg_en: false,
            cache_ip: default_cache_ip(),
            debug: false,
            mdns_src_ip: None,
            provider: None,
            ingress_bind: default_ingress_bind(),
            gateway_mac: default_gateway_mac(),
            report_collector: default_report_collector(),
            other_config: BTreeMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Parse the on-disk TOML gateway config.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn acc_ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn dpi_health_stats_interval(&self) -> Duration {
        Duration::from_secs(self.dpi_health_stats_interval_secs)
    }

    /// Build from a raw `session.conf.other_config`-style string map (§6),
    /// the legacy/runtime interface this TOML config supplements. Keys this
    /// struct doesn't model land in [`Self::other_config`] unchanged.
    pub fn from_other_config(raw: &std::collections::HashMap<String, String>) -> Self {
        let mut config = Self::default();
        let mut rest = BTreeMap::new();

        for (key, value) in raw {
            match key.as_str() {
                "provider_plugin" => config.provider_plugin = Some(value.clone()),
                "policy_table" => config.policy_table = value.clone(),
                "mqtt_v" => config.mqtt_topic = value.clone(),
                "blk_mqtt" => config.blocker_topic = Some(value.clone()),
                "targeted_devices" => config.targeted_devices = split_csv(value),
                "excluded_devices" => config.excluded_devices = split_csv(value),
                "dpi_dispatcher" => config.dpi_dispatcher = value != "0",
                "queue_num" => config.queue_num = Some(value.clone()),
                "nfqueue_buff_size" => config.nfqueue_buff_size = value.parse().ok(),
                "nfqueue_length" => config.nfqueue_length = value.parse().ok(),
                "ttl" => config.ttl_secs = value.parse().unwrap_or(default_ttl_secs()),
                "dpi_health_stats_topic" => config.dpi_health_stats_topic = value.clone(),
                "dpi_health_stats_interval_secs" => {
                    config.dpi_health_stats_interval_secs = value.parse().unwrap_or(default_health_interval_secs())
                }
                "wc_health_stats_topic" => config.wc_health_stats_topic = Some(value.clone()),
                "wc_health_stats_interval_secs" => config.wc_health_stats_interval_secs = value.parse().ok(),
                "sandbox_size" => config.sandbox_size = value.parse().unwrap_or(default_sandbox_size()),
                "rts_dict_expiry" => config.rts_dict_expiry_secs = value.parse().ok(),
                "scan_dbg_en" => config.scan_dbg_en = value == "true" || value == "1",
                "cache_ip" => config.cache_ip = value != "0",
                "debug" => config.debug = value == "true" || value == "1",
                "mdns_src_ip" => config.mdns_src_ip = value.parse().ok(),
                "provider" => config.provider = Some(value.clone()),
                _ => {
                    rest.insert(key.clone(), value.clone());
                }
            }
        }
        config.other_config = rest;
        config
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_unset_keys() {
        let config = GatewayConfig::default();
        assert_eq!(config.policy_table, "default");
        assert_eq!(config.acc_ttl(), Duration::from_secs(300));
        assert!(config.dpi_dispatcher);
    }

    #[test]
    fn parses_csv_device_lists_from_other_config() {
        let mut raw = std::collections::HashMap::new();
        raw.insert("targeted_devices".to_string(), "aa:bb, cc:dd".to_string());
        let config = GatewayConfig::from_other_config(&raw);
        assert_eq!(config.targeted_devices, vec!["aa:bb".to_string(), "cc:dd".to_string()]);
    }

    #[test]
    fn unrecognized_keys_land_in_escape_hatch() {
        let mut raw = std::collections::HashMap::new();
        raw.insert("some_future_key".to_string(), "42".to_string());
        let config = GatewayConfig::from_other_config(&raw);
        assert_eq!(config.other_config.get("some_future_key"), Some(&"42".to_string()));
    }

    #[test]
    fn parses_toml_config() {
        let text = r#"
            policy_table = "lan"
            ttl_secs = 60
        "#;
        let config = GatewayConfig::from_toml(text).unwrap();
        assert_eq!(config.policy_table, "lan");
        assert_eq!(config.ttl_secs, 60);
    }
}
