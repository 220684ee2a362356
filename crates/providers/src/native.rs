use super::{
    RuleUploader, ServiceConfig, SyncRuntimeConfig, TransformToAlerts, Transformed, UpsertRule,
};
use chrono::Utc;
use cortex::{AlertmanagerConfig, HELPER_TEMPLATE};
use models::{Alert, Error, ErrorKind, RuleGroup};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Service configuration of the Cortex uploader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CortexConfig {
    pub group_wait: String,
    pub group_interval: String,
    pub repeat_interval: String,
    /// Base of the webhook through which alertmanager posts alerts back.
    pub webhook_base_api: String,
    /// Deadline of each request to Cortex.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CortexConfig {
    fn default() -> Self {
        Self {
            group_wait: "30s".to_string(),
            group_interval: "5m".to_string(),
            repeat_interval: "4h".to_string(),
            webhook_base_api: "http://localhost:8080/v1beta1/alerts/cortex".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// The subset of the Cortex API used by CortexUploader.
#[async_trait::async_trait]
pub trait Ruler: Send + Sync {
    async fn create_rule_group(
        &self,
        namespace: &str,
        group: &RuleGroup,
    ) -> Result<(), cortex::Error>;

    async fn delete_rule_group(
        &self,
        namespace: &str,
        group_name: &str,
    ) -> Result<(), cortex::Error>;

    async fn create_alertmanager_config(
        &self,
        config: &AlertmanagerConfig,
        template_files: &BTreeMap<String, String>,
    ) -> Result<(), cortex::Error>;
}

#[async_trait::async_trait]
impl Ruler for cortex::Client {
    async fn create_rule_group(
        &self,
        namespace: &str,
        group: &RuleGroup,
    ) -> Result<(), cortex::Error> {
        cortex::Client::create_rule_group(self, namespace, group).await
    }

    async fn delete_rule_group(
        &self,
        namespace: &str,
        group_name: &str,
    ) -> Result<(), cortex::Error> {
        cortex::Client::delete_rule_group(self, namespace, group_name).await
    }

    async fn create_alertmanager_config(
        &self,
        config: &AlertmanagerConfig,
        template_files: &BTreeMap<String, String>,
    ) -> Result<(), cortex::Error> {
        cortex::Client::create_alertmanager_config(self, config, template_files).await
    }
}

type Connect<R> = Box<dyn Fn(&str, Duration) -> Result<R, cortex::Error> + Send + Sync>;

/// RuleUploader of the built-in "cortex" provider type. A Ruler is connected
/// to the provider's host for each call, and every call runs with the
/// namespace URN bound as its Cortex tenant.
pub struct CortexUploader<R = cortex::Client> {
    config: RwLock<CortexConfig>,
    connect: Connect<R>,
}

impl CortexUploader {
    pub fn new(config: CortexConfig) -> Self {
        Self::with_connector(config, cortex::Client::new)
    }
}

impl<R: Ruler> CortexUploader<R> {
    /// Build a CortexUploader which connects to hosts using `connect`.
    pub fn with_connector<F>(config: CortexConfig, connect: F) -> Self
    where
        F: Fn(&str, Duration) -> Result<R, cortex::Error> + Send + Sync + 'static,
    {
        Self {
            config: RwLock::new(config),
            connect: Box::new(connect),
        }
    }

    pub fn config(&self) -> CortexConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn ruler(&self, host: &str) -> models::Result<R> {
        Ok((self.connect)(host, self.config().timeout)?)
    }
}

#[async_trait::async_trait]
impl<R: Ruler> RuleUploader for CortexUploader<R> {
    #[tracing::instrument(
        skip_all,
        fields(
            rule = %request.rule.name,
            namespace = %request.rule.namespace,
            group = %request.rule.group_name,
        ),
        err,
    )]
    async fn upsert_rule(&self, request: UpsertRule) -> models::Result<()> {
        let UpsertRule {
            namespace_urn,
            provider,
            rule,
            rendered_group,
            ..
        } = request;

        let rules = templates::decode_rule_nodes(&rendered_group)
            .map_err(|err| Error::from(err).context("cannot parse upserted rule"))?;
        let ruler = self.ruler(&provider.host)?;

        if rules.is_empty() {
            let deleted = cortex::with_tenant(
                namespace_urn,
                ruler.delete_rule_group(&rule.namespace, &rule.group_name),
            )
            .await;

            return match deleted {
                Ok(()) => Ok(()),
                Err(cortex::Error::NotFound) => {
                    tracing::debug!("rule group was already absent");
                    Ok(())
                }
                Err(err) => Err(Error::from(err).context("error calling cortex")),
            };
        }

        let group = RuleGroup {
            name: rule.group_name.clone(),
            interval: None,
            rules,
        };
        cortex::with_tenant(namespace_urn, ruler.create_rule_group(&rule.namespace, &group))
            .await
            .map_err(|err| Error::from(err).context("error calling cortex"))
    }

    #[tracing::instrument(
        skip_all,
        fields(namespace = %request.namespace_urn, provider = request.provider.id),
        err,
    )]
    async fn sync_runtime_config(&self, request: SyncRuntimeConfig) -> models::Result<()> {
        let config = self.config();
        if config.webhook_base_api.is_empty() {
            return Err(Error::invalid(
                "cortex webhook base api in config cannot be empty",
            ));
        }

        let alertmanager = AlertmanagerConfig {
            group_wait: config.group_wait,
            group_interval: config.group_interval,
            repeat_interval: config.repeat_interval,
            webhook_url: format!("{}/{}", config.webhook_base_api, request.provider.id),
            receivers: Vec::new(),
        };
        let template_files =
            BTreeMap::from([("helper.tmpl".to_string(), HELPER_TEMPLATE.to_string())]);

        let ruler = self.ruler(&request.provider.host)?;
        cortex::with_tenant(
            request.namespace_urn,
            ruler.create_alertmanager_config(&alertmanager, &template_files),
        )
        .await
        .map_err(|err| Error::from(err).context("failed to sync alertmanager config"))
    }

    async fn set_config(&self, config: ServiceConfig) -> models::Result<()> {
        let config: CortexConfig =
            serde_json::from_value(serde_json::Value::Object(config.into_iter().collect()))
                .map_err(|err| {
                    Error::new(ErrorKind::Invalid, err).context("invalid cortex service config")
                })?;

        tracing::info!(?config, "configured cortex uploader");
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }

    async fn transform_to_alerts(&self, request: TransformToAlerts) -> models::Result<Transformed> {
        let TransformToAlerts {
            provider_id,
            namespace_id,
            body,
        } = request;

        let GroupAlert { group_key, alerts } = serde_json::from_value(body).map_err(|err| {
            Error::new(ErrorKind::Invalid, err).context("failed to decode cortex alerts payload")
        })?;

        let mut transformed = Transformed::default();
        let mut skipped = 0;

        for item in alerts {
            if item.status == "firing" {
                transformed.firing_count += 1;
            }
            match item.into_alert(provider_id, namespace_id, &group_key) {
                Some(alert) => transformed.alerts.push(alert),
                None => skipped += 1,
            }
        }
        if skipped != 0 {
            tracing::error!(skipped, %group_key, "parameters are missing for alert");
        }
        Ok(transformed)
    }
}

/// Payload of an alertmanager webhook_config notification.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupAlert {
    #[serde(default)]
    group_key: String,
    #[serde(default)]
    alerts: Vec<WebhookAlert>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookAlert {
    #[serde(default)]
    status: String,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(rename = "generatorURL", default)]
    generator_url: String,
    #[serde(default)]
    fingerprint: String,
    #[serde(default)]
    starts_at: String,
}

impl WebhookAlert {
    /// Map into an Alert, or None if the alert lacks a required label or annotation.
    fn into_alert(self, provider_id: u64, namespace_id: u64, group_key: &str) -> Option<Alert> {
        let label = self.labels.get("severity")?;
        let severity = if self.status == "resolved" {
            self.status.clone()
        } else {
            label.clone()
        };
        let triggered_at = chrono::DateTime::parse_from_rfc3339(&self.starts_at)
            .ok()?
            .with_timezone(&Utc);

        let annotation = |key: &str| self.annotations.get(key).cloned();
        let resource_name = annotation("resource")?;
        let rule = annotation("template")?;
        let metric_name = annotation("metric_name")?;
        let metric_value = annotation("metric_value")?;

        Some(Alert {
            id: 0,
            provider_id,
            namespace_id,
            resource_name,
            metric_name,
            metric_value,
            severity,
            rule,
            triggered_at,
            group_key: group_key.to_string(),
            status: self.status,
            annotations: self.annotations,
            labels: self.labels,
            generator_url: self.generator_url,
            fingerprint: self.fingerprint,
        })
    }
}
