use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Handshake negotiated with a provider plugin before any RPC is issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol_version: u32,
    pub magic_cookie_key: String,
    pub magic_cookie_value: String,
}

/// Descriptor of a single provider plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Binary to launch. Defaults to `{plugin_path}/{key}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<PathBuf>,
    pub handshake: Handshake,
    /// Opaque configuration delivered to the plugin by `SetConfig`.
    #[serde(default)]
    pub service_config: BTreeMap<String, serde_json::Value>,
}

/// Provider plugins, keyed on the provider type they serve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginsConfig {
    #[serde(default)]
    pub plugin_path: PathBuf,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginConfig>,
}

impl PluginsConfig {
    /// Resolve the binary which is launched for plugin `key`.
    pub fn command_of(&self, key: &str, config: &PluginConfig) -> PathBuf {
        match &config.command {
            Some(command) => command.clone(),
            None => self.plugin_path.join(key),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_plugins_config_from_yaml() {
        let config: PluginsConfig = serde_yaml::from_str(
            r#"
plugin_path: /opt/plugins
plugins:
  cortex:
    handshake:
      protocol_version: 1
      magic_cookie_key: cortex
      magic_cookie_value: cortexv1
    service_config:
      webhook_base_api: http://localhost:8080/v1beta1/alerts/cortex
      group_wait: 30s
  prometheus:
    command: /usr/local/bin/prom-plugin
    handshake:
      protocol_version: 2
      magic_cookie_key: prom
      magic_cookie_value: promv2
"#,
        )
        .unwrap();

        let cortex = &config.plugins["cortex"];
        assert_eq!(
            config.command_of("cortex", cortex),
            PathBuf::from("/opt/plugins/cortex")
        );
        let prom = &config.plugins["prometheus"];
        assert_eq!(
            config.command_of("prometheus", prom),
            PathBuf::from("/usr/local/bin/prom-plugin")
        );

        insta::assert_json_snapshot!(cortex.service_config, @r###"
        {
          "group_wait": "30s",
          "webhook_base_api": "http://localhost:8080/v1beta1/alerts/cortex"
        }
        "###);
    }
}
