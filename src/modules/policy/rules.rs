//! Traffic policy and rule definitions.

use serde::{Deserialize, Serialize};

/// Kind of traffic policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    /// Match a named request header.
    Header,
    /// Match the resolved client region.
    Geo,
    /// Match the request path.
    Path,
    /// Admit a deterministic percentage cohort.
    Canary,
    /// Always matches, always allows.
    Default,
}

/// Operator applied when matching a rule value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOperator {
    /// Exact equality.
    Equals,
    /// Substring containment.
    Contains,
    /// Regular expression match.
    Regex,
    /// Prefix match (path policies).
    Prefix,
}

/// What a matching rule does with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Continue, optionally toward the rule's backend.
    Allow,
    /// Refuse the request.
    Deny,
    /// Route to the rule's backend when it is selectable.
    Redirect,
}

/// A single matching rule inside a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Field to inspect (header name, `region`, or ignored for path).
    pub field: String,
    /// Matching operator.
    pub operator: MatchOperator,
    /// Value to match against.
    pub value: String,
    /// Action on match.
    pub action: RuleAction,
    /// Concrete backend id for allow/redirect actions.
    #[serde(default)]
    pub backend: Option<String>,
    /// Relative rule weight (informational).
    #[serde(default)]
    pub weight: u32,
}

/// Conditions gating when a policy applies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConditions {
    /// Percentage of traffic admitted to a canary cohort (0-100).
    #[serde(default)]
    pub percentage_traffic: u8,
}

/// An ordered traffic routing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficPolicy {
    /// Unique policy name.
    pub name: String,
    /// Policy kind.
    #[serde(rename = "type")]
    pub policy_type: PolicyType,
    /// Whether the policy participates in evaluation.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Evaluation priority; higher runs first.
    pub priority: i32,
    /// Policy-level weight (informational, used by canary tooling).
    #[serde(default)]
    pub weight: u32,
    /// Rules evaluated in order; the first match decides.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    /// Gating conditions.
    #[serde(default)]
    pub conditions: PolicyConditions,
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_toml_roundtrip() {
        let toml_src = r#"
            name = "Header-Based API Routing"
            type = "header"
            priority = 90

            [[rules]]
            field = "X-Client-Type"
            operator = "contains"
            value = "premium"
            action = "redirect"
            backend = "http://localhost:8081"
            weight = 15
        "#;

        let policy: TrafficPolicy = toml::from_str(toml_src).unwrap();
        assert_eq!(policy.policy_type, PolicyType::Header);
        assert!(policy.enabled);
        assert_eq!(policy.priority, 90);
        assert_eq!(policy.rules.len(), 1);
        assert_eq!(policy.rules[0].operator, MatchOperator::Contains);
        assert_eq!(policy.rules[0].action, RuleAction::Redirect);
        assert_eq!(
            policy.rules[0].backend.as_deref(),
            Some("http://localhost:8081")
        );
    }

    #[test]
    fn test_canary_conditions() {
        let toml_src = r#"
            name = "Canary Deployment"
            type = "canary"
            priority = 80

            [conditions]
            percentage_traffic = 30
        "#;

        let policy: TrafficPolicy = toml::from_str(toml_src).unwrap();
        assert_eq!(policy.policy_type, PolicyType::Canary);
        assert_eq!(policy.conditions.percentage_traffic, 30);
        assert!(policy.rules.is_empty());
    }
}
