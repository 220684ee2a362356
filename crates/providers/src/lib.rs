//! The Rule Uploader capability, through which rule state and runtime
//! configuration are pushed to a provider's alerting backend.
//!
//! A `RuleUploader` is implemented natively (see `CortexUploader`) or by a proxy of
//! a provider plugin running out of process. The reconciliation service only
//! ever sees `Arc<dyn RuleUploader>` instances, looked up by provider type
//! from a `Registry`.

use models::{Alert, Provider, Rule, Template};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

mod native;

pub use native::{CortexConfig, CortexUploader, Ruler};

/// Push the rendered Rule Group of `rule` to the backend of `provider`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpsertRule {
    pub namespace_urn: String,
    pub provider: Provider,
    /// The upserted rule, with merged variables.
    pub rule: Rule,
    /// Template of the upserted rule.
    pub template: Template,
    /// Concatenated rendering of every enabled rule of the group.
    /// Blank when none are enabled, which removes the group.
    pub rendered_group: String,
}

/// Push alert routing configuration of a namespace to `provider`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRuntimeConfig {
    pub namespace_id: u64,
    pub namespace_urn: String,
    pub provider: Provider,
}

/// Decode an inbound alert webhook payload of the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformToAlerts {
    pub provider_id: u64,
    pub namespace_id: u64,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transformed {
    pub alerts: Vec<Alert>,
    pub firing_count: usize,
}

/// Opaque service configuration of an uploader.
pub type ServiceConfig = BTreeMap<String, serde_json::Value>;

#[async_trait::async_trait]
pub trait RuleUploader: Send + Sync {
    async fn upsert_rule(&self, request: UpsertRule) -> models::Result<()>;

    async fn sync_runtime_config(&self, request: SyncRuntimeConfig) -> models::Result<()>;

    /// Configure the uploader. Called once, before any other method.
    async fn set_config(&self, config: ServiceConfig) -> models::Result<()>;

    async fn transform_to_alerts(&self, request: TransformToAlerts) -> models::Result<Transformed>;
}

/// Registry of RuleUploaders by provider type.
#[derive(Clone, Default)]
pub struct Registry {
    uploaders: BTreeMap<String, Arc<dyn RuleUploader>>,
}

impl Registry {
    /// Register `uploader` for `provider_type`, replacing any previous one.
    pub fn register(&mut self, provider_type: impl Into<String>, uploader: Arc<dyn RuleUploader>) {
        let provider_type = provider_type.into();
        tracing::debug!(%provider_type, "registered rule uploader");
        self.uploaders.insert(provider_type, uploader);
    }

    pub fn get(&self, provider_type: &str) -> Option<Arc<dyn RuleUploader>> {
        self.uploaders.get(provider_type).cloned()
    }

    /// Like `get`, but failing with Unimplemented for an unregistered type.
    pub fn require(&self, provider_type: &str) -> models::Result<Arc<dyn RuleUploader>> {
        self.get(provider_type).ok_or_else(|| {
            models::Error::unimplemented(format!(
                "no rule uploader is registered for provider type {provider_type:?}"
            ))
        })
    }

    pub fn provider_types(&self) -> impl Iterator<Item = &str> {
        self.uploaders.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.uploaders.keys()).finish()
    }
}
