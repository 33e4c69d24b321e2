//! Traffic policy evaluation.

use super::error::{PolicyError, PolicyResult};
use super::rules::{MatchOperator, PolicyRule, PolicyType, RuleAction, TrafficPolicy};
use crate::modules::server_pool::{Backend, ServerPool};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Request attributes the engine evaluates against.
#[derive(Debug, Clone, Default)]
pub struct PolicyRequest {
    /// Request path.
    pub path: String,
    /// Resolved client region (lowercased).
    pub region: String,
    /// Client IP address.
    pub client_ip: String,
    /// User-Agent header value.
    pub user_agent: String,
    /// Request headers, keys lowercased.
    pub headers: HashMap<String, String>,
}

impl PolicyRequest {
    /// Create an empty request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the resolved region.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Set the client IP.
    #[must_use]
    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = ip.into();
        self
    }

    /// Set the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    /// Add a header (key is lowercased).
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_lowercase(), value.into());
        self
    }
}

/// Outcome of policy evaluation.
#[derive(Debug, Clone)]
pub enum PolicyDecision {
    /// Route to this backend.
    Route(Arc<Backend>),
    /// Refuse the request (surfaced as 403).
    Deny {
        /// Name of the denying policy.
        policy: String,
    },
    /// No policy decided; fall through to normal selection.
    Pass,
}

/// A policy with its regex rules compiled ahead of evaluation.
#[derive(Debug)]
struct CompiledPolicy {
    policy: TrafficPolicy,
    /// One entry per rule; `Some` only for regex operators.
    regexes: Vec<Option<Regex>>,
}

impl CompiledPolicy {
    fn compile(policy: TrafficPolicy) -> PolicyResult<Self> {
        let mut regexes = Vec::with_capacity(policy.rules.len());
        for rule in &policy.rules {
            if rule.operator == MatchOperator::Regex {
                let regex =
                    Regex::new(&rule.value).map_err(|source| PolicyError::InvalidRegex {
                        policy: policy.name.clone(),
                        pattern: rule.value.clone(),
                        source,
                    })?;
                regexes.push(Some(regex));
            } else {
                regexes.push(None);
            }
        }
        Ok(Self { policy, regexes })
    }

    fn matches(&self, rule_idx: usize, candidate: &str) -> bool {
        let rule = &self.policy.rules[rule_idx];
        match rule.operator {
            MatchOperator::Equals => candidate == rule.value,
            MatchOperator::Contains => candidate.contains(&rule.value),
            MatchOperator::Prefix => candidate.starts_with(&rule.value),
            MatchOperator::Regex => self.regexes[rule_idx]
                .as_ref()
                .is_some_and(|re| re.is_match(candidate)),
        }
    }
}

/// The policy engine.
///
/// Holds typed backend references through the pool, so a policy decision
/// is always against the current backend set and selectability state.
#[derive(Debug)]
pub struct TrafficPolicyEngine {
    pool: Arc<ServerPool>,
    policies: RwLock<Vec<CompiledPolicy>>,
}

impl TrafficPolicyEngine {
    /// Create an engine over the pool.
    #[must_use]
    pub fn new(pool: Arc<ServerPool>) -> Self {
        Self {
            pool,
            policies: RwLock::new(Vec::new()),
        }
    }

    /// Install a policy, keeping the set ordered by descending priority.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidRegex`] when a regex rule fails to
    /// compile; the policy set is unchanged.
    pub fn add_policy(&self, policy: TrafficPolicy) -> PolicyResult<()> {
        let compiled = CompiledPolicy::compile(policy)?;
        let mut policies = self.policies.write().expect("policies lock poisoned");

        info!(
            policy = %compiled.policy.name,
            kind = ?compiled.policy.policy_type,
            priority = compiled.policy.priority,
            "Installed traffic policy"
        );
        policies.push(compiled);
        policies.sort_by(|a, b| b.policy.priority.cmp(&a.policy.priority));
        Ok(())
    }

    /// Enable or disable a policy by name; returns whether it was found.
    pub fn enable_policy(&self, name: &str, enabled: bool) -> bool {
        let mut policies = self.policies.write().expect("policies lock poisoned");
        for compiled in policies.iter_mut() {
            if compiled.policy.name == name {
                compiled.policy.enabled = enabled;
                info!(policy = %name, enabled, "Traffic policy toggled");
                return true;
            }
        }
        false
    }

    /// Installed policies in evaluation order.
    #[must_use]
    pub fn policies(&self) -> Vec<TrafficPolicy> {
        self.policies
            .read()
            .expect("policies lock poisoned")
            .iter()
            .map(|c| c.policy.clone())
            .collect()
    }

    /// Evaluate a request against the enabled policies in priority order.
    #[must_use]
    pub fn evaluate(&self, request: &PolicyRequest) -> PolicyDecision {
        let policies = self.policies.read().expect("policies lock poisoned");

        for compiled in policies.iter() {
            if !compiled.policy.enabled {
                continue;
            }

            if let Some((action, rule)) = self.match_policy(compiled, request) {
                match action {
                    RuleAction::Deny => {
                        debug!(policy = %compiled.policy.name, "Request denied by policy");
                        return PolicyDecision::Deny {
                            policy: compiled.policy.name.clone(),
                        };
                    },
                    RuleAction::Redirect | RuleAction::Allow => {
                        if let Some(backend) = self.policy_backend(compiled, rule) {
                            debug!(
                                policy = %compiled.policy.name,
                                backend = %backend.id(),
                                "Request routed by policy"
                            );
                            return PolicyDecision::Route(backend);
                        }
                        // Matched without a usable concrete backend:
                        // delegate selection to the pool.
                        return PolicyDecision::Pass;
                    },
                }
            }
        }

        PolicyDecision::Pass
    }

    /// Match one policy; returns the decisive action and rule, if any.
    fn match_policy<'a>(
        &self,
        compiled: &'a CompiledPolicy,
        request: &PolicyRequest,
    ) -> Option<(RuleAction, Option<&'a PolicyRule>)> {
        let policy = &compiled.policy;
        match policy.policy_type {
            PolicyType::Default => Some((RuleAction::Allow, None)),
            PolicyType::Canary => {
                let pct = u32::from(policy.conditions.percentage_traffic);
                if pct > 0 {
                    let hash =
                        canary_hash(&request.path, &request.user_agent, &request.client_ip);
                    if hash % 100 < pct {
                        return Some((RuleAction::Allow, None));
                    }
                }
                None
            },
            PolicyType::Header => {
                for (idx, rule) in policy.rules.iter().enumerate() {
                    let value = request
                        .headers
                        .get(&rule.field.to_lowercase())
                        .map(String::as_str)
                        .unwrap_or_default();
                    if compiled.matches(idx, value) {
                        return Some((rule.action, Some(rule)));
                    }
                }
                None
            },
            PolicyType::Path => {
                for (idx, rule) in policy.rules.iter().enumerate() {
                    if compiled.matches(idx, &request.path) {
                        return Some((rule.action, Some(rule)));
                    }
                }
                None
            },
            PolicyType::Geo => {
                for (idx, rule) in policy.rules.iter().enumerate() {
                    if rule.field == "region" && compiled.matches(idx, &request.region) {
                        return Some((rule.action, Some(rule)));
                    }
                }
                None
            },
        }
    }

    /// Resolve the concrete backend a matching policy names. A decisive
    /// rule contributes only its own backend; cohort matches without a
    /// decisive rule (canary, default) may use any backend named by the
    /// policy's rules. Only selectable backends qualify.
    fn policy_backend(
        &self,
        compiled: &CompiledPolicy,
        matched: Option<&PolicyRule>,
    ) -> Option<Arc<Backend>> {
        let named: Vec<&str> = match matched {
            Some(rule) => rule.backend.as_deref().into_iter().collect(),
            None => compiled
                .policy
                .rules
                .iter()
                .filter_map(|rule| rule.backend.as_deref())
                .collect(),
        };

        for id in named {
            if let Some(backend) = self.pool.get(id) {
                if backend.is_selectable() {
                    return Some(backend);
                }
            }
        }
        None
    }
}

/// Deterministic polynomial rolling hash over `path|user-agent|ip`.
///
/// The function is part of the cohort contract: swapping it for a
/// stronger hash reshuffles which clients land in a canary cohort.
#[must_use]
pub fn canary_hash(path: &str, user_agent: &str, client_ip: &str) -> u32 {
    let input = format!("{path}|{user_agent}|{client_ip}");
    let mut hash: u32 = 0;
    for c in input.chars() {
        hash = hash.wrapping_mul(31).wrapping_add(c as u32);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::rules::PolicyConditions;

    fn pool_ab() -> Arc<ServerPool> {
        let pool = Arc::new(ServerPool::new());
        pool.add(Arc::new(Backend::new("http://a", 3, "us-east").unwrap()))
            .unwrap();
        pool.add(Arc::new(Backend::new("http://b", 1, "us-west").unwrap()))
            .unwrap();
        pool
    }

    fn header_policy(operator: MatchOperator, value: &str, action: RuleAction) -> TrafficPolicy {
        TrafficPolicy {
            name: "header".to_string(),
            policy_type: PolicyType::Header,
            enabled: true,
            priority: 90,
            weight: 0,
            rules: vec![PolicyRule {
                field: "X-Client-Type".to_string(),
                operator,
                value: value.to_string(),
                action,
                backend: Some("http://a".to_string()),
                weight: 0,
            }],
            conditions: PolicyConditions::default(),
        }
    }

    #[test]
    fn test_header_redirect_routes_to_named_backend() {
        let engine = TrafficPolicyEngine::new(pool_ab());
        engine
            .add_policy(header_policy(
                MatchOperator::Contains,
                "premium",
                RuleAction::Redirect,
            ))
            .unwrap();

        let request = PolicyRequest::new().with_header("X-Client-Type", "premium-gold");
        match engine.evaluate(&request) {
            PolicyDecision::Route(b) => assert_eq!(b.id(), "http://a"),
            other => panic!("expected route, got {other:?}"),
        }
    }

    #[test]
    fn test_header_no_match_passes() {
        let engine = TrafficPolicyEngine::new(pool_ab());
        engine
            .add_policy(header_policy(
                MatchOperator::Equals,
                "premium",
                RuleAction::Redirect,
            ))
            .unwrap();

        let request = PolicyRequest::new().with_header("X-Client-Type", "basic");
        assert!(matches!(engine.evaluate(&request), PolicyDecision::Pass));
    }

    #[test]
    fn test_header_regex_match() {
        let engine = TrafficPolicyEngine::new(pool_ab());
        engine
            .add_policy(header_policy(
                MatchOperator::Regex,
                "^v[0-9]+$",
                RuleAction::Redirect,
            ))
            .unwrap();

        let request = PolicyRequest::new().with_header("X-Client-Type", "v42");
        assert!(matches!(
            engine.evaluate(&request),
            PolicyDecision::Route(_)
        ));
    }

    #[test]
    fn test_invalid_regex_rejected_at_install() {
        let engine = TrafficPolicyEngine::new(pool_ab());
        let result = engine.add_policy(header_policy(
            MatchOperator::Regex,
            "(unclosed",
            RuleAction::Allow,
        ));
        assert!(matches!(result, Err(PolicyError::InvalidRegex { .. })));
        assert!(engine.policies().is_empty());
    }

    #[test]
    fn test_deny_decision() {
        let engine = TrafficPolicyEngine::new(pool_ab());
        engine
            .add_policy(header_policy(
                MatchOperator::Equals,
                "blocked",
                RuleAction::Deny,
            ))
            .unwrap();

        let request = PolicyRequest::new().with_header("X-Client-Type", "blocked");
        match engine.evaluate(&request) {
            PolicyDecision::Deny { policy } => assert_eq!(policy, "header"),
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[test]
    fn test_disabled_policy_skipped() {
        let engine = TrafficPolicyEngine::new(pool_ab());
        engine
            .add_policy(header_policy(
                MatchOperator::Equals,
                "blocked",
                RuleAction::Deny,
            ))
            .unwrap();
        assert!(engine.enable_policy("header", false));

        let request = PolicyRequest::new().with_header("X-Client-Type", "blocked");
        assert!(matches!(engine.evaluate(&request), PolicyDecision::Pass));
    }

    #[test]
    fn test_priority_order() {
        let engine = TrafficPolicyEngine::new(pool_ab());

        let mut low = header_policy(MatchOperator::Contains, "x", RuleAction::Redirect);
        low.name = "low".to_string();
        low.priority = 10;
        low.rules[0].backend = Some("http://b".to_string());

        let mut high = header_policy(MatchOperator::Contains, "x", RuleAction::Redirect);
        high.name = "high".to_string();
        high.priority = 100;

        engine.add_policy(low).unwrap();
        engine.add_policy(high).unwrap();

        let request = PolicyRequest::new().with_header("X-Client-Type", "x");
        match engine.evaluate(&request) {
            PolicyDecision::Route(b) => assert_eq!(b.id(), "http://a"),
            other => panic!("expected route from high-priority policy, got {other:?}"),
        }
    }

    #[test]
    fn test_path_prefix_policy() {
        let engine = TrafficPolicyEngine::new(pool_ab());
        engine
            .add_policy(TrafficPolicy {
                name: "api-v2".to_string(),
                policy_type: PolicyType::Path,
                enabled: true,
                priority: 50,
                weight: 0,
                rules: vec![PolicyRule {
                    field: "path".to_string(),
                    operator: MatchOperator::Prefix,
                    value: "/api/v2".to_string(),
                    action: RuleAction::Redirect,
                    backend: Some("http://b".to_string()),
                    weight: 0,
                }],
                conditions: PolicyConditions::default(),
            })
            .unwrap();

        let hit = PolicyRequest::new().with_path("/api/v2/users");
        assert!(matches!(engine.evaluate(&hit), PolicyDecision::Route(b) if b.id() == "http://b"));

        let miss = PolicyRequest::new().with_path("/api/v1/users");
        assert!(matches!(engine.evaluate(&miss), PolicyDecision::Pass));
    }

    #[test]
    fn test_geo_policy_matches_region() {
        let engine = TrafficPolicyEngine::new(pool_ab());
        engine
            .add_policy(TrafficPolicy {
                name: "geo".to_string(),
                policy_type: PolicyType::Geo,
                enabled: true,
                priority: 100,
                weight: 0,
                rules: vec![PolicyRule {
                    field: "region".to_string(),
                    operator: MatchOperator::Equals,
                    value: "asia".to_string(),
                    action: RuleAction::Redirect,
                    backend: Some("http://b".to_string()),
                    weight: 0,
                }],
                conditions: PolicyConditions::default(),
            })
            .unwrap();

        let hit = PolicyRequest::new().with_region("asia");
        assert!(matches!(engine.evaluate(&hit), PolicyDecision::Route(_)));

        let miss = PolicyRequest::new().with_region("us-east");
        assert!(matches!(engine.evaluate(&miss), PolicyDecision::Pass));
    }

    #[test]
    fn test_redirect_to_unselectable_backend_passes() {
        let pool = pool_ab();
        pool.get("http://a").unwrap().set_alive(false);

        let engine = TrafficPolicyEngine::new(pool);
        engine
            .add_policy(header_policy(
                MatchOperator::Equals,
                "premium",
                RuleAction::Redirect,
            ))
            .unwrap();

        let request = PolicyRequest::new().with_header("X-Client-Type", "premium");
        assert!(matches!(engine.evaluate(&request), PolicyDecision::Pass));
    }

    #[test]
    fn test_allow_without_backend_delegates() {
        let engine = TrafficPolicyEngine::new(pool_ab());
        engine
            .add_policy(TrafficPolicy {
                name: "geo".to_string(),
                policy_type: PolicyType::Geo,
                enabled: true,
                priority: 100,
                weight: 0,
                rules: vec![
                    PolicyRule {
                        field: "region".to_string(),
                        operator: MatchOperator::Equals,
                        value: "us-east".to_string(),
                        action: RuleAction::Allow,
                        backend: None,
                        weight: 10,
                    },
                    PolicyRule {
                        field: "region".to_string(),
                        operator: MatchOperator::Equals,
                        value: "asia".to_string(),
                        action: RuleAction::Redirect,
                        backend: Some("http://b".to_string()),
                        weight: 5,
                    },
                ],
                conditions: PolicyConditions::default(),
            })
            .unwrap();

        // The allow rule names no backend; another rule's backend must
        // not leak into the decision.
        let request = PolicyRequest::new().with_region("us-east");
        assert!(matches!(engine.evaluate(&request), PolicyDecision::Pass));
    }

    #[test]
    fn test_canary_uses_policy_named_backend() {
        let engine = TrafficPolicyEngine::new(pool_ab());
        let mut policy = canary_policy(100);
        policy.rules = vec![PolicyRule {
            field: "path".to_string(),
            operator: MatchOperator::Prefix,
            value: "/api/v2".to_string(),
            action: RuleAction::Allow,
            backend: Some("http://b".to_string()),
            weight: 10,
        }];
        engine.add_policy(policy).unwrap();

        let request = PolicyRequest::new()
            .with_path("/app")
            .with_client_ip("10.0.0.1");
        assert!(matches!(
            engine.evaluate(&request),
            PolicyDecision::Route(b) if b.id() == "http://b"
        ));
    }

    fn canary_policy(pct: u8) -> TrafficPolicy {
        TrafficPolicy {
            name: "canary".to_string(),
            policy_type: PolicyType::Canary,
            enabled: true,
            priority: 80,
            weight: 20,
            rules: Vec::new(),
            conditions: PolicyConditions {
                percentage_traffic: pct,
            },
        }
    }

    #[test]
    fn test_canary_full_cohort_always_matches() {
        let engine = TrafficPolicyEngine::new(pool_ab());
        engine.add_policy(canary_policy(100)).unwrap();

        // No rule backend named: the cohort is admitted and selection is
        // delegated.
        let request = PolicyRequest::new()
            .with_path("/app")
            .with_client_ip("10.0.0.1");
        assert!(matches!(engine.evaluate(&request), PolicyDecision::Pass));
    }

    #[test]
    fn test_canary_zero_cohort_never_matches() {
        let engine = TrafficPolicyEngine::new(pool_ab());
        engine.add_policy(canary_policy(0)).unwrap();

        let request = PolicyRequest::new()
            .with_path("/app")
            .with_client_ip("10.0.0.1");
        assert!(matches!(engine.evaluate(&request), PolicyDecision::Pass));
    }

    #[test]
    fn test_canary_hash_deterministic() {
        let a = canary_hash("/app", "curl/8", "10.0.0.1");
        let b = canary_hash("/app", "curl/8", "10.0.0.1");
        assert_eq!(a, b);

        let c = canary_hash("/app", "curl/8", "10.0.0.2");
        assert_ne!(a, c);
    }

    #[test]
    fn test_canary_cohort_split_roughly_matches_percentage() {
        let pct = 30u32;
        let mut admitted = 0u32;
        let total = 1000u32;

        for i in 0..total {
            let hash = canary_hash("/app", "agent", &format!("10.0.{}.{}", i / 256, i % 256));
            if hash % 100 < pct {
                admitted += 1;
            }
        }

        // Rough bound: the polynomial hash is not uniform, but the cohort
        // must be in the right ballpark.
        assert!(admitted > total * pct / 100 / 2);
        assert!(admitted < total * pct / 100 * 2);
    }
}
