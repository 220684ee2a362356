use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix of every derived rule name.
const RULE_NAME_PREFIX: &str = "tocsin_api";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleVariable {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_: String,
    pub value: String,
    #[serde(default)]
    pub description: String,
}

/// Rule is one parameterized instance of a Template, belonging to a
/// `(namespace, group_name)` Rule Group within a provider namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub id: u64,
    /// Derived by `Rule::derive_name`, and never trusted from callers.
    #[serde(default)]
    pub name: String,
    pub enabled: bool,
    pub group_name: String,
    /// Rule namespace of the remote backend. Not the Namespace entity.
    pub namespace: String,
    pub template: String,
    #[serde(default)]
    pub variables: Vec<RuleVariable>,
    /// Id of the Namespace entity this rule is provisioned into.
    pub provider_namespace: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Rule {
    /// Derive the unique name of a rule's logical slot.
    pub fn derive_name(
        provider_urn: &str,
        namespace_urn: &str,
        namespace: &str,
        group_name: &str,
        template: &str,
    ) -> String {
        format!("{RULE_NAME_PREFIX}_{provider_urn}_{namespace_urn}_{namespace}_{group_name}_{template}")
    }

    /// Variables of this rule as a name => value map.
    pub fn variable_values(&self) -> BTreeMap<String, String> {
        self.variables
            .iter()
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect()
    }
}

/// Filter of `Repository::list`. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleFilter {
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub group_name: Option<String>,
    pub template: Option<String>,
    pub provider_namespace: Option<u64>,
}

impl RuleFilter {
    pub fn matches(&self, rule: &Rule) -> bool {
        fn eq<T: PartialEq>(want: &Option<T>, have: &T) -> bool {
            want.as_ref().map(|w| w == have).unwrap_or(true)
        }
        eq(&self.name, &rule.name)
            && eq(&self.namespace, &rule.namespace)
            && eq(&self.group_name, &rule.group_name)
            && eq(&self.template, &rule.template)
            && eq(&self.provider_namespace, &rule.provider_namespace)
    }
}

/// RuleNode is a single recording or alerting rule of a remote Rule Group.
/// Labels and annotations are key-ordered so serialization is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    pub expr: String,
    #[serde(rename = "for", default, skip_serializing_if = "Option::is_none")]
    pub for_: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// RuleGroup is the remote backend's unit of rule management.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleGroup {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleNode>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_name_derivation_ignores_other_fields() {
        let name = Rule::derive_name("cortex-prod", "odpf", "billing", "g1", "cpu-usage");
        assert_eq!(name, "tocsin_api_cortex-prod_odpf_billing_g1_cpu-usage");

        let again = Rule::derive_name("cortex-prod", "odpf", "billing", "g1", "cpu-usage");
        assert_eq!(name, again);
    }

    #[test]
    fn test_filter_matching() {
        let rule = Rule {
            namespace: "billing".to_string(),
            group_name: "g1".to_string(),
            template: "cpu-usage".to_string(),
            provider_namespace: 3,
            ..Default::default()
        };

        assert!(RuleFilter::default().matches(&rule));
        assert!(RuleFilter {
            namespace: Some("billing".to_string()),
            group_name: Some("g1".to_string()),
            provider_namespace: Some(3),
            ..Default::default()
        }
        .matches(&rule));
        assert!(!RuleFilter {
            group_name: Some("g2".to_string()),
            ..Default::default()
        }
        .matches(&rule));
    }

    #[test]
    fn test_rule_node_yaml_shape() {
        let node: RuleNode = serde_yaml::from_str(
            r#"
alert: cpu high warning
expr: avg by (host) (cpu_usage_user{cpu="cpu-total"}) > 20
for: 20m
labels:
  team: gotham
  severity: WARNING
annotations:
  resource: "{{ $labels.host }}"
"#,
        )
        .unwrap();

        insta::assert_json_snapshot!(node, @r###"
        {
          "alert": "cpu high warning",
          "expr": "avg by (host) (cpu_usage_user{cpu=\"cpu-total\"}) > 20",
          "for": "20m",
          "labels": {
            "severity": "WARNING",
            "team": "gotham"
          },
          "annotations": {
            "resource": "{{ $labels.host }}"
          }
        }
        "###);
    }
}
