use anyhow::Context;
use models::PluginsConfig;
use providers::{CortexUploader, Registry, RuleUploader};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Provider type served by the built-in Cortex uploader.
pub const CORTEX_PROVIDER_TYPE: &str = "cortex";

/// Read a YAML plugins configuration from `path`.
pub fn load_plugins_config(path: &Path) -> anyhow::Result<PluginsConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plugins config {path:?}"))?;
    let config = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse plugins config {path:?}"))?;
    Ok(config)
}

/// Uploaders of a running host: the built-in ones, and those of the provider
/// plugins it launched. Plugins take precedence over a built-in uploader of
/// the same provider type.
pub struct Uploaders {
    pub registry: Registry,
    pub plugins: plugin::Manager,
    /// Built-in Cortex uploader, configured with the `service_config` of the
    /// `cortex` entry of the plugins configuration, if there is one.
    pub cortex: Arc<CortexUploader>,
}

impl Uploaders {
    pub async fn start(config: &PluginsConfig, options: plugin::Options) -> models::Result<Self> {
        let cortex = Arc::new(CortexUploader::new(Default::default()));
        if let Some(entry) = config.plugins.get(CORTEX_PROVIDER_TYPE) {
            cortex
                .set_config(entry.service_config.clone())
                .await
                .map_err(|err| err.context("configuring the built-in cortex uploader"))?;
        }

        let mut registry = Registry::default();
        registry.register(CORTEX_PROVIDER_TYPE, cortex.clone());

        let (plugins, failures) = plugin::Manager::start(config, options).await;
        for (key, err) in &failures {
            tracing::warn!(%key, error = %err, "provider plugin is unavailable");
        }
        plugins.register_all(&mut registry);

        tracing::info!(?registry, ?plugins, "started rule uploaders");
        Ok(Self {
            registry,
            plugins,
            cortex,
        })
    }

    pub async fn stop(&self) {
        self.plugins.stop().await;
    }
}

/// Parse `NAME=VALUE` arguments into a variables map.
pub fn parse_vars<S: AsRef<str>>(vars: &[S]) -> anyhow::Result<BTreeMap<String, String>> {
    vars.iter()
        .map(|var| {
            let var = var.as_ref();
            let (name, value) = var
                .split_once('=')
                .with_context(|| format!("variable {var:?} is not of the form NAME=VALUE"))?;
            Ok((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Parse a template definition, refusing names reserved by the system.
pub fn parse_template(definition: &str) -> models::Result<models::Template> {
    let template = templates::parse_definition(definition)?;

    if models::is_reserved_name(&template.name) {
        return Err(models::Error::invalid(format!(
            "template name {:?} is reserved",
            template.name
        )));
    }
    Ok(template)
}

/// Render a template definition with `vars`, which are enriched by the
/// template's declared defaults.
pub fn render_definition(
    definition: &str,
    vars: &BTreeMap<String, String>,
) -> models::Result<String> {
    let template = templates::parse_definition(definition)?;
    Ok(templates::render(&template, vars)?)
}
