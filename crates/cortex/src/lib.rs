//! Client of the Cortex ruler and alertmanager APIs.
//!
//! Every request is issued on behalf of a tenant, which is bound to the
//! calling task with `with_tenant` rather than passed to each method:
//!
//! ```ignore
//! cortex::with_tenant("odpf", client.delete_rule_group("billing", "g1")).await?;
//! ```

use models::RuleGroup;
use std::collections::BTreeMap;

mod alertmanager;

pub use alertmanager::{
    render_alertmanager_config, validate_alertmanager_config, AlertmanagerConfig, Matcher,
    PagerdutyConfig, ReceiverConfig, SlackConfig, WebhookConfig, HELPER_TEMPLATE,
};

/// Header which routes a request to its tenant.
pub const TENANT_HEADER: &str = "X-Scope-OrgID";

tokio::task_local! {
    static TENANT: String;
}

/// Run `fut` with `tenant` bound as the tenant of every client call it makes.
pub async fn with_tenant<F: std::future::Future>(tenant: impl Into<String>, fut: F) -> F::Output {
    TENANT.scope(tenant.into(), fut).await
}

/// Tenant bound to the current task, if any.
pub fn current_tenant() -> Option<String> {
    TENANT.try_with(|tenant| tenant.clone()).ok()
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid cortex address {0:?}")]
    Address(String, #[source] url::ParseError),
    #[error("no tenant is bound to this call")]
    NoTenant,
    #[error("requested resource not found")]
    NotFound,
    #[error("{method} {path}: {status}: {body}")]
    Status {
        method: reqwest::Method,
        path: String,
        status: reqwest::StatusCode,
        body: String,
    },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("failed to encode request body")]
    Encode(#[source] serde_yaml::Error),
    #[error("failed to decode response body")]
    Decode(#[source] serde_yaml::Error),
    #[error("failed to render alertmanager config")]
    Template(#[from] templates::Error),
    #[error("invalid alertmanager config: {0}")]
    InvalidConfig(String),
}

impl From<Error> for models::Error {
    fn from(err: Error) -> Self {
        use models::ErrorKind;

        let kind = match &err {
            Error::NotFound => ErrorKind::NotFound,
            Error::Status { .. } | Error::Http(_) | Error::Decode(_) => ErrorKind::Unavailable,
            Error::Address(..)
            | Error::NoTenant
            | Error::Encode(_)
            | Error::Template(_)
            | Error::InvalidConfig(_) => ErrorKind::Invalid,
        };
        models::Error::new(kind, err)
    }
}

/// Client of a single Cortex deployment.
#[derive(Debug, Clone)]
pub struct Client {
    // Base URL of the Cortex deployment.
    address: url::Url,
    // HTTP client, which bounds every request by its timeout.
    http_client: reqwest::Client,
}

/// Request body of the alertmanager configuration API.
#[derive(serde::Serialize)]
struct AlertmanagerUpload<'a> {
    template_files: &'a BTreeMap<String, String>,
    alertmanager_config: &'a str,
}

impl Client {
    /// Build a Client of the Cortex deployment at `address`, where each
    /// request is bounded by `timeout`.
    pub fn new(address: &str, timeout: std::time::Duration) -> Result<Self, Error> {
        let parsed =
            url::Url::parse(address).map_err(|err| Error::Address(address.to_string(), err))?;
        if parsed.cannot_be_a_base() {
            return Err(Error::Address(
                address.to_string(),
                url::ParseError::RelativeUrlWithCannotBeABaseBase,
            ));
        }
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            address: parsed,
            http_client,
        })
    }

    /// Create or replace the rule group `group` within `namespace`.
    #[tracing::instrument(skip(self, group), fields(group = %group.name), err)]
    pub async fn create_rule_group(&self, namespace: &str, group: &RuleGroup) -> Result<(), Error> {
        let body = serde_yaml::to_string(group).map_err(Error::Encode)?;
        self.execute(reqwest::Method::POST, &["rules", namespace], Some(body))
            .await?;
        Ok(())
    }

    /// Delete the rule group `group_name` of `namespace`.
    #[tracing::instrument(skip(self), err)]
    pub async fn delete_rule_group(&self, namespace: &str, group_name: &str) -> Result<(), Error> {
        self.execute(reqwest::Method::DELETE, &["rules", namespace, group_name], None)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn get_rule_group(
        &self,
        namespace: &str,
        group_name: &str,
    ) -> Result<RuleGroup, Error> {
        let body = self
            .execute(reqwest::Method::GET, &["rules", namespace, group_name], None)
            .await?;
        serde_yaml::from_str(&body).map_err(Error::Decode)
    }

    /// List rule groups by namespace, of a single `namespace` or of all.
    #[tracing::instrument(skip(self), err)]
    pub async fn list_rules(
        &self,
        namespace: Option<&str>,
    ) -> Result<BTreeMap<String, Vec<RuleGroup>>, Error> {
        let path: Vec<&str> = std::iter::once("rules").chain(namespace).collect();
        let body = self.execute(reqwest::Method::GET, &path, None).await?;

        if body.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_yaml::from_str(&body).map_err(Error::Decode)
    }

    /// Render `config`, validate it, and upload it as the tenant's alertmanager
    /// configuration. An invalid rendering fails before any request is sent.
    #[tracing::instrument(skip_all, err)]
    pub async fn create_alertmanager_config(
        &self,
        config: &AlertmanagerConfig,
        template_files: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let rendered = render_alertmanager_config(config)?;
        validate_alertmanager_config(&rendered)?;

        let body = serde_yaml::to_string(&AlertmanagerUpload {
            template_files,
            alertmanager_config: &rendered,
        })
        .map_err(Error::Encode)?;

        self.execute(reqwest::Method::POST, &["alerts"], Some(body))
            .await?;
        Ok(())
    }

    async fn execute(
        &self,
        method: reqwest::Method,
        segments: &[&str],
        body: Option<String>,
    ) -> Result<String, Error> {
        let tenant = current_tenant().ok_or(Error::NoTenant)?;

        let mut url = self.address.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(["api", "v1"]).extend(segments);
        }
        let path = url.path().to_string();

        let mut builder = self
            .http_client
            .request(method.clone(), url)
            .header(TENANT_HEADER, &tenant);
        if let Some(body) = body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/yaml")
                .body(body);
        }
        let request = builder.build()?;
        tracing::debug!(url = %request.url(), %method, %tenant, "sending request");

        let response = self.http_client.execute(request).await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            Ok(body)
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Err(Error::NotFound)
        } else {
            Err(Error::Status {
                method,
                path,
                status,
                body,
            })
        }
    }
}
