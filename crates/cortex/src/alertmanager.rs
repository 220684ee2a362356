use super::Error;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Alertmanager notification templates uploaded alongside every config.
pub const HELPER_TEMPLATE: &str = include_str!("helper.tmpl");

const CONFIG_TEMPLATE: &str = include_str!("config.yaml.tmpl");

/// AlertmanagerConfig is the model from which a tenant's alertmanager
/// configuration is rendered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertmanagerConfig {
    pub group_wait: String,
    pub group_interval: String,
    pub repeat_interval: String,
    /// Webhook of the default receiver, through which alerts are ingested.
    pub webhook_url: String,
    #[serde(default)]
    pub receivers: Vec<ReceiverConfig>,
}

/// A notification receiver, with the alert matchers which route to it.
/// Exactly one of its notifier configurations is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    pub name: String,
    #[serde(default)]
    pub matchers: Vec<Matcher>,
    pub slack: Option<SlackConfig>,
    pub pagerduty: Option<PagerdutyConfig>,
    pub webhook: Option<WebhookConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matcher {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackConfig {
    pub channel: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagerdutyConfig {
    pub service_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
}

impl ReceiverConfig {
    /// Build a ReceiverConfig from a receiver `type_` and its untyped configuration.
    pub fn new(
        name: impl Into<String>,
        type_: &str,
        matchers: &BTreeMap<String, String>,
        configuration: &BTreeMap<String, String>,
    ) -> Result<Self, Error> {
        let get = |key: &str| {
            configuration
                .get(key)
                .filter(|value| !value.is_empty())
                .cloned()
                .ok_or_else(|| {
                    Error::InvalidConfig(format!("{type_} receiver configuration is missing {key:?}"))
                })
        };

        let mut receiver = Self {
            name: name.into(),
            matchers: matchers
                .iter()
                .map(|(name, value)| Matcher {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            ..Default::default()
        };

        match type_ {
            "slack" => {
                receiver.slack = Some(SlackConfig {
                    channel: get("channel_name")?,
                    token: get("token")?,
                })
            }
            "pagerduty" => {
                receiver.pagerduty = Some(PagerdutyConfig {
                    service_key: get("service_key")?,
                })
            }
            "http" => receiver.webhook = Some(WebhookConfig { url: get("url")? }),
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unsupported receiver type {other:?}"
                )))
            }
        }
        Ok(receiver)
    }
}

/// Render `config` into alertmanager YAML.
pub fn render_alertmanager_config(config: &AlertmanagerConfig) -> Result<String, Error> {
    Ok(templates::Text::parse(CONFIG_TEMPLATE)?.render(config)?)
}

#[derive(Deserialize)]
struct Document {
    route: Option<Route>,
    #[serde(default)]
    receivers: Vec<Receiver>,
}

#[derive(Deserialize)]
struct Route {
    receiver: Option<String>,
    #[serde(rename = "match", default)]
    matchers: Option<BTreeMap<String, String>>,
    group_wait: Option<String>,
    group_interval: Option<String>,
    repeat_interval: Option<String>,
    #[serde(default)]
    routes: Option<Vec<Route>>,
}

#[derive(Deserialize)]
struct Receiver {
    #[serde(default)]
    name: String,
    #[serde(default)]
    webhook_configs: Option<Vec<WebhookConfig>>,
}

/// Validate a rendered alertmanager configuration, applying the checks
/// alertmanager applies when it loads a configuration.
pub fn validate_alertmanager_config(rendered: &str) -> Result<(), Error> {
    let invalid = |message: String| Err(Error::InvalidConfig(message));

    let document: Document = serde_yaml::from_str(rendered)
        .map_err(|err| Error::InvalidConfig(format!("failed to parse config: {err}")))?;

    let mut names = BTreeSet::new();
    for receiver in &document.receivers {
        if receiver.name.is_empty() {
            return invalid("missing name in receiver".to_string());
        }
        if !names.insert(receiver.name.as_str()) {
            return invalid(format!(
                "notification config name {:?} is not unique",
                receiver.name
            ));
        }
        for webhook in receiver.webhook_configs.iter().flatten() {
            if let Err(err) = url::Url::parse(&webhook.url) {
                return invalid(format!("invalid webhook url {:?}: {err}", webhook.url));
            }
        }
    }

    let Some(route) = &document.route else {
        return invalid("no route provided in config".to_string());
    };
    if route.receiver.as_deref().unwrap_or_default().is_empty() {
        return invalid("root route must specify a default receiver".to_string());
    }
    if route.matchers.as_ref().map(|m| !m.is_empty()).unwrap_or(false) {
        return invalid("root route must not have any matchers".to_string());
    }
    validate_route(route, &names)
}

fn validate_route(route: &Route, receivers: &BTreeSet<&str>) -> Result<(), Error> {
    if let Some(receiver) = &route.receiver {
        if !receivers.contains(receiver.as_str()) {
            return Err(Error::InvalidConfig(format!(
                "undefined receiver {receiver:?} used in route"
            )));
        }
    }
    for (field, value) in [
        ("group_wait", &route.group_wait),
        ("group_interval", &route.group_interval),
        ("repeat_interval", &route.repeat_interval),
    ] {
        let Some(value) = value else { continue };

        match humantime::parse_duration(value) {
            Err(err) => {
                return Err(Error::InvalidConfig(format!(
                    "invalid {field} {value:?}: {err}"
                )))
            }
            Ok(d) if d.is_zero() && field != "group_wait" => {
                return Err(Error::InvalidConfig(format!("{field} cannot be zero")))
            }
            Ok(_) => (),
        }
    }
    for child in route.routes.iter().flatten() {
        validate_route(child, receivers)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture() -> AlertmanagerConfig {
        AlertmanagerConfig {
            group_wait: "30s".to_string(),
            group_interval: "5m".to_string(),
            repeat_interval: "4h".to_string(),
            webhook_url: "http://localhost:8080/v1beta1/alerts/cortex/3".to_string(),
            receivers: vec![
                ReceiverConfig::new(
                    "slack-gotham",
                    "slack",
                    &[("team".to_string(), "gotham".to_string())].into(),
                    &[
                        ("channel_name".to_string(), "alerts".to_string()),
                        ("token".to_string(), "xoxb-123".to_string()),
                    ]
                    .into(),
                )
                .unwrap(),
                ReceiverConfig::new(
                    "pager-ops",
                    "pagerduty",
                    &[
                        ("severity".to_string(), "CRITICAL".to_string()),
                        ("team".to_string(), "ops".to_string()),
                    ]
                    .into(),
                    &[("service_key".to_string(), "abc".to_string())].into(),
                )
                .unwrap(),
            ],
        }
    }

    #[test]
    fn test_render_config() {
        let rendered = render_alertmanager_config(&fixture()).unwrap();
        validate_alertmanager_config(&rendered).unwrap();

        insta::assert_snapshot!(rendered, @r###"
        templates:
          - 'helper.tmpl'
        global:
          pagerduty_url: https://events.pagerduty.com/v2/enqueue
          resolve_timeout: 5m
        receivers:
          - name: default
            webhook_configs:
              - url: 'http://localhost:8080/v1beta1/alerts/cortex/3'
          - name: 'slack-gotham'
            slack_configs:
              - channel: 'alerts'
                api_url: https://slack.com/api/chat.postMessage
                http_config:
                  authorization:
                    credentials: 'xoxb-123'
                title: '{{ template "slack.default.title" . }}'
                text: '{{ template "slack.default.body" . }}'
          - name: 'pager-ops'
            pagerduty_configs:
              - service_key: 'abc'
                description: '{{ template "pagerduty.default.description" . }}'
        route:
          receiver: default
          group_by: [alertname, severity, owner, service_name, time_stamp, identifier]
          group_wait: 30s
          group_interval: 5m
          repeat_interval: 4h
          routes:
            - receiver: 'slack-gotham'
              continue: true
              match:
                team: 'gotham'
            - receiver: 'pager-ops'
              continue: true
              match:
                severity: 'CRITICAL'
                team: 'ops'
        "###);
    }

    #[test]
    fn test_render_config_without_receivers() {
        let config = AlertmanagerConfig {
            receivers: Vec::new(),
            ..fixture()
        };
        let rendered = render_alertmanager_config(&config).unwrap();
        validate_alertmanager_config(&rendered).unwrap();
    }

    #[test]
    fn test_receiver_configuration_errors() {
        let empty = BTreeMap::new();
        insta::assert_debug_snapshot!(
            [
                ReceiverConfig::new("x", "slack", &empty, &[("token".to_string(), "t".to_string())].into())
                    .unwrap_err()
                    .to_string(),
                ReceiverConfig::new("x", "email", &empty, &empty).unwrap_err().to_string(),
            ],
            @r###"
        [
            "invalid alertmanager config: slack receiver configuration is missing \"channel_name\"",
            "invalid alertmanager config: unsupported receiver type \"email\"",
        ]
        "###
        );
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            "receivers:\n  - name: default\n",
            "route:\n  group_wait: 30s\nreceivers:\n  - name: default\n",
            "route:\n  receiver: default\n  match:\n    a: b\nreceivers:\n  - name: default\n",
            "route:\n  receiver: default\n  routes:\n    - receiver: nope\nreceivers:\n  - name: default\n",
            "route:\n  receiver: default\nreceivers:\n  - name: default\n  - name: default\n",
            "route:\n  receiver: default\n  group_interval: 0s\nreceivers:\n  - name: default\n",
            "route:\n  receiver: default\nreceivers:\n  - name: default\n    webhook_configs:\n      - url: not a url\n",
        ];
        let errors: Vec<String> = cases
            .iter()
            .map(|case| validate_alertmanager_config(case).unwrap_err().to_string())
            .collect();

        insta::assert_debug_snapshot!(errors, @r###"
        [
            "invalid alertmanager config: no route provided in config",
            "invalid alertmanager config: root route must specify a default receiver",
            "invalid alertmanager config: root route must not have any matchers",
            "invalid alertmanager config: undefined receiver \"nope\" used in route",
            "invalid alertmanager config: notification config name \"default\" is not unique",
            "invalid alertmanager config: group_interval cannot be zero",
            "invalid alertmanager config: invalid webhook url \"not a url\": relative URL without a base",
        ]
        "###);

        let err = validate_alertmanager_config(
            "route:\n  receiver: default\n  repeat_interval: forever\nreceivers:\n  - name: default\n",
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("invalid alertmanager config: invalid repeat_interval \"forever\": "));
    }
}
