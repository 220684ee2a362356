use super::{Client, PluginUploader};
use models::PluginsConfig;
use providers::{Registry, RuleUploader};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Options {
    /// Deadline of each call to a plugin.
    pub call_timeout: Duration,
    /// Time allowed for a plugin to exit after SIGTERM, before it's killed.
    pub stop_grace: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Manager owns the provider plugins launched by a host,
/// from their launch until `stop()`.
pub struct Manager {
    clients: Mutex<BTreeMap<String, Arc<Client>>>,
    options: Options,
}

impl Manager {
    /// Launch and configure each plugin of `config`. A plugin which fails to
    /// launch, handshake, or accept its configuration is skipped, and its error
    /// is returned alongside the Manager of plugins which did start.
    pub async fn start(
        config: &PluginsConfig,
        options: Options,
    ) -> (Self, BTreeMap<String, models::Error>) {
        let mut clients = BTreeMap::new();
        let mut failures = BTreeMap::new();

        for (key, plugin) in &config.plugins {
            let command = config.command_of(key, plugin);

            match Self::start_one(key, &command, plugin, &options).await {
                Ok(client) => {
                    tracing::info!(%key, ?command, "started provider plugin");
                    clients.insert(key.clone(), client);
                }
                Err(err) => {
                    tracing::error!(%key, ?command, error = %err, "failed to start provider plugin");
                    failures.insert(key.clone(), err);
                }
            }
        }

        let manager = Self {
            clients: Mutex::new(clients),
            options,
        };
        (manager, failures)
    }

    async fn start_one(
        key: &str,
        command: &std::path::Path,
        plugin: &models::PluginConfig,
        options: &Options,
    ) -> models::Result<Arc<Client>> {
        let client = Client::launch(key, command, &plugin.handshake, options.call_timeout)
            .await
            .map_err(|err| models::Error::from(err).context(format!("plugin {key:?}")))?;
        let client = Arc::new(client);

        // The service config is a BTreeMap, and serializes with sorted keys.
        if let Err(err) = PluginUploader::new(client.clone())
            .set_config(plugin.service_config.clone())
            .await
        {
            client.stop(options.stop_grace).await;
            return Err(err);
        }
        Ok(client)
    }

    /// Keys of running plugins.
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// RuleUploader of the plugin `key`, if it's running.
    pub fn uploader(&self, key: &str) -> Option<Arc<dyn RuleUploader>> {
        self.lock()
            .get(key)
            .map(|client| Arc::new(PluginUploader::new(client.clone())) as Arc<dyn RuleUploader>)
    }

    /// Register every running plugin with `registry`, keyed on its provider type.
    pub fn register_all(&self, registry: &mut Registry) {
        for (key, client) in self.lock().iter() {
            registry.register(key.clone(), Arc::new(PluginUploader::new(client.clone())));
        }
    }

    /// Stop every running plugin. Stopping again is a no-op.
    pub async fn stop(&self) {
        let clients = std::mem::take(&mut *self.lock());

        futures::future::join_all(
            clients
                .values()
                .map(|client| client.stop(self.options.stop_grace)),
        )
        .await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Arc<Client>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("plugins", &self.keys())
            .field("options", &self.options)
            .finish()
    }
}

