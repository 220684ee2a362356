use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Alert is an ingested notification from a Provider's alertmanager webhook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(default)]
    pub id: u64,
    pub provider_id: u64,
    pub namespace_id: u64,
    pub resource_name: String,
    pub metric_name: String,
    pub metric_value: String,
    /// Severity label of a firing alert, or "resolved".
    pub severity: String,
    /// Name of the Template which produced the alerting rule.
    pub rule: String,
    pub triggered_at: DateTime<Utc>,
    pub group_key: String,
    pub status: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub generator_url: String,
    #[serde(default)]
    pub fingerprint: String,
}
