//! `PolicyRequest`/`PolicyReply` (§3) and the external-provider contracts
//! they flow through (categorization, gatekeeper).

use crate::rule::{PolicyAction, ReportLevel};
use std::net::IpAddr;

/// Kind of request presented to the policy engine (§3 `req_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqType {
    Fqdn,
    Url,
    Host,
    Sni,
    Ipv4,
    Ipv6,
    App,
    FqdnFlow,
    Ipv4Flow,
    Ipv6Flow,
}

/// Input to the policy engine, built by an attribute-client plugin (§3).
#[derive(Debug, Clone)]
pub struct PolicyRequest {
    pub req_type: ReqType,
    pub device_mac: [u8; 6],
    pub url: Option<String>,
    pub ip_addr: Option<IpAddr>,
    /// Opaque accumulator handle (index/generation packed by `dpi-dataplane`);
    /// the policy engine never dereferences it, only threads it through.
    pub accumulator: Option<u64>,
    pub pending_req: bool,
    pub rule_name: Option<String>,
    pub action: PolicyAction,
    pub report_flag: bool,
}

impl PolicyRequest {
    pub fn new(req_type: ReqType, device_mac: [u8; 6]) -> Self {
        Self {
            req_type,
            device_mac,
            url: None,
            ip_addr: None,
            accumulator: None,
            pending_req: false,
            rule_name: None,
            action: PolicyAction::None,
            report_flag: false,
        }
    }

    /// The value this request is matched against (FQDN or IP string), used
    /// by the fqdn/ip predicates.
    pub fn match_value(&self) -> Option<String> {
        if let Some(url) = &self.url {
            Some(url.clone())
        } else {
            self.ip_addr.map(|ip| ip.to_string())
        }
    }

    pub fn mac_string(&self) -> String {
        let m = self.device_mac;
        format!("{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", m[0], m[1], m[2], m[3], m[4], m[5])
    }
}

/// FQDN categorization status (§3's `categorized`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatStatus {
    #[default]
    Nop,
    Failed,
    Pending,
    Success,
}

/// Outcome of evaluating a `PolicyRequest` against a table (§3 `PolicyReply`).
#[derive(Debug, Clone)]
pub struct PolicyReply {
    pub req_id: u64,
    pub req_type: ReqType,
    pub action: PolicyAction,
    pub log_action: String,
    /// Redirect TTL; `-1` means "use provider/default" per the §3 invariant.
    pub rd_ttl: i64,
    pub cache_ttl: i64,
    pub categorized: CatStatus,
    pub log_level: ReportLevel,
    pub policy_name: Option<String>,
    pub policy_idx: Option<u32>,
    pub rule_name: Option<String>,
    pub updatev4_tag: Option<String>,
    pub updatev6_tag: Option<String>,
    pub excluded_devices: Option<Vec<String>>,
    pub redirect: bool,
    pub redirects: [Option<String>; 2],
    pub risk_level: Option<i32>,
    pub fsm_checked: bool,
    pub from_cache: bool,
    pub cat_unknown_to_service: bool,
    pub provider: Option<String>,
    pub to_report: bool,
}

impl PolicyReply {
    pub fn no_match(req_id: u64, req_type: ReqType) -> Self {
        Self {
            req_id,
            req_type,
            action: PolicyAction::NoMatch,
            log_action: "no_match".to_string(),
            rd_ttl: -1,
            cache_ttl: -1,
            categorized: CatStatus::Nop,
            log_level: ReportLevel::None,
            policy_name: None,
            policy_idx: None,
            rule_name: None,
            updatev4_tag: None,
            updatev6_tag: None,
            excluded_devices: None,
            redirect: false,
            redirects: [None, None],
            risk_level: None,
            fsm_checked: false,
            from_cache: false,
            cat_unknown_to_service: false,
            provider: None,
            to_report: false,
        }
    }
}

/// A category lookup result from the web-categorization backend (§4.8 `category` predicate).
#[derive(Debug, Clone)]
pub struct CategoryResult {
    pub categories: Vec<String>,
    pub lookup_failed: bool,
}

/// External category/risk provider. Out of scope per §1 — only its
/// contract matters here.
pub trait CategoryProvider: Send + Sync {
    fn categories_check(&self, fqdn: &str) -> CategoryResult;
    fn risk_level(&self, fqdn: &str) -> Option<i32>;
}

/// Gatekeeper verdict, filled in by the external provider when a rule's
/// action is `gatekeeper_req` (§4.8).
#[derive(Debug, Clone)]
pub struct GatekeeperResult {
    pub categorized: CatStatus,
    pub action: PolicyAction,
    pub rule_name: Option<String>,
    pub risk_level: Option<i32>,
    pub to_report: Option<bool>,
}

/// External web-categorization/gatekeeper backend (§1 out-of-scope collaborator).
pub trait GatekeeperProvider: Send + Sync {
    fn gatekeeper_check(&self, req: &PolicyRequest) -> GatekeeperResult;
}
