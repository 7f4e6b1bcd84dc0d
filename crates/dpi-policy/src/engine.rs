//! Policy engine (C7) — `apply()` implements the evaluation order of §4.8.
//!
//! Grounded on `sase-policy::PolicyEngine`'s tiered-lookup shape (store +
//! atomic counters), minus the bloom filter / LRU fast path: the spec's
//! tables are small and explicitly O(table-size) (§3), so the fast-path
//! machinery the teacher built for millions-of-rules CIDR tables has no
//! counterpart here (see DESIGN.md).

use crate::request::{CatStatus, CategoryProvider, GatekeeperProvider, PolicyReply, PolicyRequest, ReqType};
use crate::rule::{FqdnMatchMode, NullTagResolver, PolicyAction, PolicyRule, ReportLevel, TagResolver};
use crate::store::{PolicyClient, TableStore};
use dpi_common::AtomicCounter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Engine-wide lookup counters, exposed for the health-stats report (C9).
#[derive(Debug, Default)]
pub struct EngineStats {
    pub lookups: u64,
    pub matches: u64,
    pub no_matches: u64,
}

/// Evaluates `PolicyRequest`s against named tables (§4.8).
pub struct PolicyEngine {
    store: TableStore,
    resolver: Arc<dyn TagResolver>,
    category: Option<Arc<dyn CategoryProvider>>,
    gatekeeper: Option<Arc<dyn GatekeeperProvider>>,
    lookups: AtomicCounter,
    matches: AtomicCounter,
    no_matches: AtomicCounter,
    next_req_id: AtomicU64,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            store: TableStore::new(),
            resolver: Arc::new(NullTagResolver),
            category: None,
            gatekeeper: None,
            lookups: AtomicCounter::new(0),
            matches: AtomicCounter::new(0),
            no_matches: AtomicCounter::new(0),
            next_req_id: AtomicU64::new(1),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn TagResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_category_provider(mut self, provider: Arc<dyn CategoryProvider>) -> Self {
        self.category = Some(provider);
        self
    }

    pub fn with_gatekeeper_provider(mut self, provider: Arc<dyn GatekeeperProvider>) -> Self {
        self.gatekeeper = Some(provider);
        self
    }

    pub fn register_client(&self, tables: &[String], client: Arc<dyn PolicyClient>) {
        self.store.register_client(tables, client);
    }

    pub fn deregister_client(&self, client: &Arc<dyn PolicyClient>) {
        self.store.deregister_client(client);
    }

    pub fn update_table(&self, table: crate::rule::PolicyTable) {
        self.store.update_table(table);
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            lookups: self.lookups.get(),
            matches: self.matches.get(),
            no_matches: self.no_matches.get(),
        }
    }

    /// Evaluate `req` against `table_name` and return the decorated reply
    /// (§4.8). Missing tables produce `no_match` per §7's error taxonomy.
    pub fn apply(&self, table_name: &str, req: &PolicyRequest) -> PolicyReply {
        self.lookups.inc();
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);

        let Some(table) = self.store.get(table_name) else {
            self.no_matches.inc();
            return PolicyReply::no_match(req_id, req.req_type);
        };

        let match_value = req.match_value();
        let mac = req.mac_string();

        let mut last_observed: Option<&PolicyRule> = None;
        let mut winner: Option<&PolicyRule> = None;
        let mut log_level = ReportLevel::None;
        let mut to_report = false;

        for rule in table.rules.iter() {
            if !self.predicates_hold(rule, req, &mac, match_value.as_deref()) {
                continue;
            }
            // Every rule the walk matches contributes its report level,
            // not just the terminal one (§4.8: `log_level = max(existing,
            // rule.report_level)`).
            if rule.report_level > log_level {
                log_level = rule.report_level;
            }
            to_report |= rule.report_level != ReportLevel::None;

            if rule.action == PolicyAction::None {
                last_observed = Some(rule);
                continue;
            }
            winner = Some(rule);
            break;
        }

        let mut reply = match winner.or(last_observed) {
            Some(rule) => self.build_reply(req_id, req, rule, winner.is_some()),
            None => {
                self.no_matches.inc();
                PolicyReply::no_match(req_id, req.req_type)
            }
        };
        reply.log_level = log_level;
        reply.to_report = to_report;

        if winner.is_some() || last_observed.is_some() {
            self.matches.inc();
        }

        if reply.action == PolicyAction::GatekeeperReq {
            return self.run_gatekeeper(req, reply);
        }

        reply
    }

    fn predicates_hold(
        &self,
        rule: &PolicyRule,
        req: &PolicyRequest,
        mac: &str,
        match_value: Option<&str>,
    ) -> bool {
        if let Some(mac_rule) = &rule.mac_rule {
            if !mac_rule.holds(self.resolver.as_ref(), mac) {
                return false;
            }
        }
        if let Some(fqdn_rule) = &rule.fqdn_rule {
            let Some(value) = match_value else { return false };
            if matches!(
                fqdn_rule.mode,
                FqdnMatchMode::Exact | FqdnMatchMode::Suffix | FqdnMatchMode::Prefix | FqdnMatchMode::Wildcard
            ) && !fqdn_rule.holds(self.resolver.as_ref(), value)
            {
                return false;
            }
        }
        if let Some(ip_rule) = &rule.ip_rule {
            let Some(value) = match_value else { return false };
            if !ip_rule.holds(self.resolver.as_ref(), value) {
                return false;
            }
        }
        if let Some(cat_rule) = &rule.cat_rule {
            let Some(fqdn) = match_value else { return false };
            let categorized = self
                .category
                .as_ref()
                .map(|provider| provider.categories_check(fqdn))
                .unwrap_or(crate::request::CategoryResult { categories: vec![], lookup_failed: true });
            let hit = categorized.categories.iter().any(|cat| cat_rule.holds(self.resolver.as_ref(), cat));
            if !hit {
                return false;
            }
        }
        if let Some(risk_rule) = &rule.risk_rule {
            let risk = match_value
                .and_then(|fqdn| self.category.as_ref().and_then(|p| p.risk_level(fqdn)))
                .unwrap_or(0);
            if !risk_rule.holds(risk) {
                return false;
            }
        }
        if let Some(app_rule) = &rule.app_rule {
            let Some(app) = req.rule_name.as_deref() else { return false };
            if !app_rule.holds(self.resolver.as_ref(), app) {
                return false;
            }
        }
        true
    }

    fn build_reply(&self, req_id: u64, req: &PolicyRequest, rule: &PolicyRule, terminal: bool) -> PolicyReply {
        let action = if terminal { rule.action } else { PolicyAction::Observed };
        PolicyReply {
            req_id,
            req_type: req.req_type,
            action,
            log_action: log_action_for(action, false),
            rd_ttl: rule.other_config.rd_ttl,
            cache_ttl: -1,
            categorized: CatStatus::Nop,
            log_level: rule.report_level,
            policy_name: Some(rule.name.clone()),
            policy_idx: Some(rule.index),
            rule_name: Some(rule.name.clone()),
            updatev4_tag: rule.other_config.tagv4_name.clone(),
            updatev6_tag: rule.other_config.tagv6_name.clone(),
            excluded_devices: None,
            redirect: action == PolicyAction::Redirect,
            redirects: rule.redirects.clone(),
            risk_level: None,
            fsm_checked: false,
            from_cache: false,
            cat_unknown_to_service: false,
            provider: None,
            to_report: rule.report_level != ReportLevel::None,
        }
    }

    fn run_gatekeeper(&self, req: &PolicyRequest, mut reply: PolicyReply) -> PolicyReply {
        let Some(gk) = &self.gatekeeper else {
            return reply;
        };
        let result = gk.gatekeeper_check(req);
        let originating_rule = reply.rule_name.clone();
        let originating_wanted_report = reply.to_report;

        reply.categorized = result.categorized;
        reply.action = result.action;
        reply.risk_level = result.risk_level;
        reply.fsm_checked = true;

        match result.to_report {
            Some(already_set) => reply.to_report = already_set,
            None => {
                if originating_wanted_report {
                    reply.to_report = true;
                    reply.rule_name = originating_rule;
                } else if let Some(name) = result.rule_name {
                    reply.rule_name = Some(name);
                }
            }
        }
        reply.log_action = log_action_for(reply.action, matches!(reply.categorized, CatStatus::Failed));
        reply
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// User-facing action string, with the FQDN-categorization-failure special
/// case from §4.8's closing paragraph.
fn log_action_for(action: PolicyAction, cache_lookup_failed: bool) -> String {
    if action == PolicyAction::NoMatch {
        return if cache_lookup_failed { "cacheLookupFailed" } else { "remoteLookupFailed" }.to_string();
    }
    match action {
        PolicyAction::None => "observed",
        PolicyAction::Block => "blocked",
        PolicyAction::Allow => "allowed",
        PolicyAction::Observed => "observed",
        PolicyAction::NoMatch => unreachable!(),
        PolicyAction::Redirect => "redirected",
        PolicyAction::Forward => "forwarded",
        PolicyAction::UpdateTag => "tag_updated",
        PolicyAction::GatekeeperReq => "gatekeeper",
        PolicyAction::FlushCache => "flush_cache",
        PolicyAction::FlushAllCache => "flush_all_cache",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{FqdnPredicate, Operand, PolicyTable, SetOp, SetPredicate};

    fn block_adult_table() -> PolicyTable {
        let mut rule = PolicyRule::new("block-adult", 0, PolicyAction::Block);
        rule.fqdn_rule = Some(FqdnPredicate {
            mode: FqdnMatchMode::Exact,
            invert: false,
            operands: vec![Operand::Literal("adult.com".into())],
        });
        rule.report_level = ReportLevel::All;
        PolicyTable::new("lan", vec![rule])
    }

    #[test]
    fn fqdn_block_matches() {
        let engine = PolicyEngine::new();
        engine.update_table(block_adult_table());

        let mut req = PolicyRequest::new(ReqType::Fqdn, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        req.url = Some("adult.com".to_string());

        let reply = engine.apply("lan", &req);
        assert_eq!(reply.action, PolicyAction::Block);
        assert!(reply.to_report);
        assert_eq!(reply.log_action, "blocked");
    }

    #[test]
    fn missing_table_is_no_match() {
        let engine = PolicyEngine::new();
        let req = PolicyRequest::new(ReqType::Fqdn, [0; 6]);
        let reply = engine.apply("missing", &req);
        assert_eq!(reply.action, PolicyAction::NoMatch);
        assert_eq!(reply.log_level, ReportLevel::None);
    }

    #[test]
    fn observe_and_continue_falls_through() {
        let engine = PolicyEngine::new();
        let mut observe = PolicyRule::new("log-only", 0, PolicyAction::None);
        observe.report_level = ReportLevel::All;
        observe.mac_rule = Some(SetPredicate { op: SetOp::True, operands: vec![] });
        let allow = PolicyRule::new("allow-all", 1, PolicyAction::Allow);
        engine.update_table(PolicyTable::new("lan", vec![observe, allow]));

        let req = PolicyRequest::new(ReqType::Ipv4, [0; 6]);
        let reply = engine.apply("lan", &req);
        assert_eq!(reply.action, PolicyAction::Allow);
    }
}
