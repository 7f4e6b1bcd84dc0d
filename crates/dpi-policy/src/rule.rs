//! Policy rule and table types (§3 `PolicyRule`, `PolicyTable`).
//!
//! Generalized from `sase-policy::PolicyRule`'s CIDR/port-range predicate
//! chain (same "every present predicate must hold" matching shape) to the
//! spec's MAC/FQDN/IP/category/risk/app predicate set with tag-expression
//! operands instead of raw CIDRs.

use serde::{Deserialize, Serialize};

/// An operand-set member: either a literal value or a reference to a named
/// tag collection (§3: plain `${TAG}`, group `$[TAG]`, local `${*TAG}`,
/// cloud `${@TAG}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// A literal value compared directly.
    Literal(String),
    /// `${TAG}` — a plain named tag collection.
    PlainTag(String),
    /// `$[TAG]` — a group tag collection.
    GroupTag(String),
    /// `${*TAG}` — a local tag collection.
    LocalTag(String),
    /// `${@TAG}` — a cloud tag collection.
    CloudTag(String),
}

/// Resolves tag operands to their literal membership, so the engine never
/// has to know where tag collections are stored.
pub trait TagResolver: Send + Sync {
    /// Expand a tag operand into its literal members. Literal operands
    /// resolve to themselves without a lookup.
    fn resolve(&self, operand: &Operand) -> Vec<String>;
}

/// A resolver with no backing tag store: plain tags resolve to themselves,
/// group/local/cloud tags resolve empty. Useful for tests and for policy
/// tables that only use literal operands.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTagResolver;

impl TagResolver for NullTagResolver {
    fn resolve(&self, operand: &Operand) -> Vec<String> {
        match operand {
            Operand::Literal(v) | Operand::PlainTag(v) => vec![v.clone()],
            Operand::GroupTag(_) | Operand::LocalTag(_) | Operand::CloudTag(_) => Vec::new(),
        }
    }
}

/// `IN`/`OUT`/`TRUE` membership test shared by mac/ip/category/app predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetOp {
    /// Match when the value is present in the operand set.
    In,
    /// Match when the value is absent from the operand set.
    Out,
    /// Always match; operand set is ignored.
    True,
}

/// A membership predicate over a resolved operand set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPredicate {
    /// Membership semantics.
    pub op: SetOp,
    /// Operand set, possibly referencing named tag collections.
    pub operands: Vec<Operand>,
}

impl SetPredicate {
    /// Evaluate against `value`, resolving operands through `resolver`.
    pub fn holds(&self, resolver: &dyn TagResolver, value: &str) -> bool {
        if self.op == SetOp::True {
            return true;
        }
        let member = self
            .operands
            .iter()
            .flat_map(|op| resolver.resolve(op))
            .any(|candidate| candidate.eq_ignore_ascii_case(value));
        match self.op {
            SetOp::In => member,
            SetOp::Out => !member,
            SetOp::True => true,
        }
    }
}

/// FQDN comparison mode (§4.8): exact, right-anchored suffix, left-anchored
/// prefix, or wildcard (`fnmatch`-style).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FqdnMatchMode {
    /// Exact match (`XM`).
    Exact,
    /// Right-anchored suffix match (`SFR`).
    Suffix,
    /// Left-anchored prefix match (`SFL`).
    Prefix,
    /// Wildcard match with `*`/`?` globbing (`WILD`).
    Wildcard,
}

/// FQDN predicate: match mode plus `IN`/`OUT` inversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FqdnPredicate {
    /// Comparison mode.
    pub mode: FqdnMatchMode,
    /// `true` for `OUT` (absence), `false` for `IN` (presence).
    pub invert: bool,
    /// Operand set of FQDN patterns, possibly tag references.
    pub operands: Vec<Operand>,
}

impl FqdnPredicate {
    /// Evaluate against a request FQDN.
    pub fn holds(&self, resolver: &dyn TagResolver, fqdn: &str) -> bool {
        let fqdn_lower = fqdn.to_ascii_lowercase();
        let member = self.operands.iter().flat_map(|op| resolver.resolve(op)).any(|pattern| {
            let pattern = pattern.to_ascii_lowercase();
            match self.mode {
                FqdnMatchMode::Exact => fqdn_lower == pattern,
                FqdnMatchMode::Suffix => fqdn_lower.ends_with(&pattern),
                FqdnMatchMode::Prefix => fqdn_lower.starts_with(&pattern),
                FqdnMatchMode::Wildcard => wildcard_match(&pattern, &fqdn_lower),
            }
        });
        member != self.invert
    }
}

fn wildcard_match(pattern: &str, value: &str) -> bool {
    fn rec(p: &[u8], v: &[u8]) -> bool {
        match p.first() {
            None => v.is_empty(),
            Some(b'*') => rec(&p[1..], v) || (!v.is_empty() && rec(p, &v[1..])),
            Some(b'?') => !v.is_empty() && rec(&p[1..], &v[1..]),
            Some(&c) => v.first() == Some(&c) && rec(&p[1..], &v[1..]),
        }
    }
    rec(pattern.as_bytes(), value.as_bytes())
}

/// Risk-level comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskOp {
    Eq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,
}

/// Risk predicate: compares a provider-supplied risk level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPredicate {
    pub op: RiskOp,
    pub level: i32,
}

impl RiskPredicate {
    pub fn holds(&self, risk: i32) -> bool {
        match self.op {
            RiskOp::Eq => risk == self.level,
            RiskOp::Neq => risk != self.level,
            RiskOp::Lt => risk < self.level,
            RiskOp::Gt => risk > self.level,
            RiskOp::Le => risk <= self.level,
            RiskOp::Ge => risk >= self.level,
        }
    }
}

/// Final action of a rule or reply (§3 `PolicyReply.action`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyAction {
    /// Observe-and-continue; never a terminal reply action unless no
    /// stronger rule matched afterwards.
    None,
    Block,
    Allow,
    Observed,
    NoMatch,
    Redirect,
    Forward,
    UpdateTag,
    GatekeeperReq,
    FlushCache,
    FlushAllCache,
}

/// Reporting verbosity, ordered `All > Blocked > None` (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReportLevel {
    None = 0,
    Blocked = 1,
    All = 2,
}

/// Free-form per-rule configuration (§3 `other_config`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Redirect TTL override; `-1` means "use provider/default" (§3 invariant).
    pub rd_ttl: i64,
    /// Tag name to attach on an IPv4 answer update.
    pub tagv4_name: Option<String>,
    /// Tag name to attach on an IPv6 answer update.
    pub tagv6_name: Option<String>,
    /// Devices excluded from this rule regardless of other predicates.
    pub excluded_devices: Option<Vec<Operand>>,
}

impl RuleConfig {
    pub fn new() -> Self {
        Self { rd_ttl: -1, ..Default::default() }
    }
}

/// One ordered rule in a policy table (§3 `PolicyRule`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,
    pub index: u32,
    pub mac_rule: Option<SetPredicate>,
    pub fqdn_rule: Option<FqdnPredicate>,
    pub ip_rule: Option<SetPredicate>,
    pub cat_rule: Option<SetPredicate>,
    pub risk_rule: Option<RiskPredicate>,
    pub app_rule: Option<SetPredicate>,
    pub action: PolicyAction,
    pub report_level: ReportLevel,
    pub redirects: [Option<String>; 2],
    pub other_config: RuleConfig,
    pub next_table: Option<String>,
}

impl PolicyRule {
    /// A minimal rule with only a name/index/action, useful in tests.
    pub fn new(name: impl Into<String>, index: u32, action: PolicyAction) -> Self {
        Self {
            name: name.into(),
            index,
            mac_rule: None,
            fqdn_rule: None,
            ip_rule: None,
            cat_rule: None,
            risk_rule: None,
            app_rule: None,
            action,
            report_level: ReportLevel::None,
            redirects: [None, None],
            other_config: RuleConfig::new(),
            next_table: None,
        }
    }
}

/// Maximum rules in a single table (§3: "bounded by a fixed max, e.g. 60").
pub const MAX_TABLE_RULES: usize = 60;

/// A named, ordered policy table (§3 `PolicyTable`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyTable {
    pub name: String,
    pub rules: Vec<PolicyRule>,
}

impl PolicyTable {
    pub fn new(name: impl Into<String>, rules: Vec<PolicyRule>) -> Self {
        Self { name: name.into(), rules }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_predicate_in_out() {
        let resolver = NullTagResolver;
        let pred = SetPredicate {
            op: SetOp::In,
            operands: vec![Operand::Literal("aa:bb:cc:dd:ee:01".into())],
        };
        assert!(pred.holds(&resolver, "aa:bb:cc:dd:ee:01"));
        assert!(!pred.holds(&resolver, "ff:ff:ff:ff:ff:ff"));

        let pred_out = SetPredicate { op: SetOp::Out, ..pred };
        assert!(!pred_out.holds(&resolver, "aa:bb:cc:dd:ee:01"));
    }

    #[test]
    fn fqdn_suffix_and_wildcard() {
        let resolver = NullTagResolver;
        let suffix = FqdnPredicate {
            mode: FqdnMatchMode::Suffix,
            invert: false,
            operands: vec![Operand::Literal("adult.com".into())],
        };
        assert!(suffix.holds(&resolver, "www.adult.com"));
        assert!(!suffix.holds(&resolver, "adult.com.example.net"));

        let wild = FqdnPredicate {
            mode: FqdnMatchMode::Wildcard,
            invert: false,
            operands: vec![Operand::Literal("*.ads.*".into())],
        };
        assert!(wild.holds(&resolver, "x.ads.net"));
    }

    #[test]
    fn risk_ops() {
        let pred = RiskPredicate { op: RiskOp::Ge, level: 70 };
        assert!(pred.holds(80));
        assert!(!pred.holds(50));
    }
}
