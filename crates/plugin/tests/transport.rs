use models::{ErrorKind, Handshake, PluginConfig, PluginsConfig};
use plugin::{Client, Manager, Options, PluginUploader};
use providers::{RuleUploader, TransformToAlerts};
use serde_json::json;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CORTEX_PLUGIN: &str = env!("CARGO_BIN_EXE_cortex-plugin");

fn cortex_handshake() -> Handshake {
    Handshake {
        protocol_version: 1,
        magic_cookie_key: "cortex".to_string(),
        magic_cookie_value: "cortexv1".to_string(),
    }
}

fn cortex_plugin(handshake: Handshake) -> PluginConfig {
    PluginConfig {
        command: Some(PathBuf::from(CORTEX_PLUGIN)),
        handshake,
        service_config: serde_json::from_value(json!({
            "webhook_base_api": "http://tocsin.example/v1beta1/alerts/cortex",
            "group_wait": "1m",
        }))
        .unwrap(),
    }
}

fn options() -> Options {
    Options {
        call_timeout: Duration::from_secs(10),
        stop_grace: Duration::from_secs(2),
    }
}

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn alert_group(firing: usize, resolved: usize) -> serde_json::Value {
    let alert = |status: &str, index: usize| {
        json!({
            "status": status,
            "labels": {"severity": "CRITICAL", "alertname": "cpu_high"},
            "annotations": {
                "resource": format!("host-{index}"),
                "template": "cpu-usage",
                "metric_name": "cpu_usage_user",
                "metric_value": "97.5",
            },
            "generatorURL": "http://cortex.example/graph",
            "fingerprint": format!("fp{index}"),
            "startsAt": "2026-10-17T08:00:00Z",
        })
    };
    let alerts: Vec<_> = (0..firing)
        .map(|i| alert("firing", i))
        .chain((0..resolved).map(|i| alert("resolved", firing + i)))
        .collect();

    json!({"groupKey": "{}:{alertname=\"cpu_high\"}", "alerts": alerts})
}

#[tokio::test]
async fn test_mismatched_cookie_fails_only_its_own_plugin() {
    let mut shady = cortex_handshake();
    shady.magic_cookie_value = "not-the-cookie".to_string();

    let config = PluginsConfig {
        plugin_path: PathBuf::new(),
        plugins: [
            ("cortex".to_string(), cortex_plugin(cortex_handshake())),
            ("shady".to_string(), cortex_plugin(shady)),
        ]
        .into_iter()
        .collect(),
    };

    let (manager, failures) = Manager::start(&config, options()).await;
    assert_eq!(manager.keys(), ["cortex"]);
    assert_eq!(failures.keys().collect::<Vec<_>>(), ["shady"]);

    let err = &failures["shady"];
    assert_eq!(err.kind, ErrorKind::Unavailable);
    let message = err.to_string();
    assert!(
        message.starts_with("unavailable: plugin \"shady\": plugin exited before completing its handshake (exit status: 1)"),
        "{message}"
    );
    assert!(message.contains("magic cookie"), "{message}");

    // The correctly configured plugin serves calls.
    let uploader = manager.uploader("cortex").unwrap();
    let transformed = uploader
        .transform_to_alerts(TransformToAlerts {
            provider_id: 3,
            namespace_id: 7,
            body: alert_group(2, 1),
        })
        .await
        .unwrap();

    assert_eq!(transformed.firing_count, 2);
    assert_eq!(transformed.alerts.len(), 3);
    assert_eq!(
        transformed
            .alerts
            .iter()
            .map(|a| (a.resource_name.as_str(), a.severity.as_str(), a.namespace_id))
            .collect::<Vec<_>>(),
        [
            ("host-0", "CRITICAL", 7),
            ("host-1", "CRITICAL", 7),
            ("host-2", "resolved", 7),
        ]
    );

    manager.stop().await;
}

#[tokio::test]
async fn test_launch_failures() {
    let tmp = tempfile::tempdir().unwrap();

    let mut newer = cortex_plugin(cortex_handshake());
    newer.handshake.protocol_version = 2;

    let mut missing = cortex_plugin(cortex_handshake());
    missing.command = None; // Resolves to `{plugin_path}/missing`.

    let mut garbled = cortex_plugin(cortex_handshake());
    garbled.command = Some(script(tmp.path(), "garbled", "echo hello there; sleep 5"));

    let mut rejecting = cortex_plugin(cortex_handshake());
    rejecting.service_config = serde_json::from_value(json!({"timeout": "whenever"})).unwrap();

    let config = PluginsConfig {
        plugin_path: tmp.path().to_owned(),
        plugins: [
            ("newer".to_string(), newer),
            ("missing".to_string(), missing),
            ("garbled".to_string(), garbled),
            ("rejecting".to_string(), rejecting),
        ]
        .into_iter()
        .collect(),
    };

    let (manager, failures) = Manager::start(&config, options()).await;
    assert!(manager.keys().is_empty());

    let failures: BTreeMap<_, _> = failures
        .into_iter()
        .map(|(key, err)| (key, (err.kind, err.to_string())))
        .collect();

    assert_eq!(
        failures["newer"],
        (
            ErrorKind::Unavailable,
            "unavailable: plugin \"newer\": incompatible plugin protocol version 1 (expected 2)"
                .to_string()
        )
    );
    assert_eq!(
        failures["garbled"],
        (
            ErrorKind::Unavailable,
            "unavailable: plugin \"garbled\": malformed plugin handshake \"hello there\""
                .to_string()
        )
    );

    let (kind, message) = &failures["missing"];
    assert_eq!(*kind, ErrorKind::Unavailable);
    assert!(
        message.starts_with("unavailable: plugin \"missing\": failed to launch plugin command"),
        "{message}"
    );

    // The plugin launched, but refused its service config.
    let (kind, message) = &failures["rejecting"];
    assert_eq!(*kind, ErrorKind::Invalid);
    assert!(
        message.starts_with(
            "invalid: plugin \"rejecting\" set_config: invalid cortex service config"
        ),
        "{message}"
    );
}

#[tokio::test]
async fn test_concurrent_calls_and_stop() {
    let config = PluginsConfig {
        plugin_path: PathBuf::new(),
        plugins: [("cortex".to_string(), cortex_plugin(cortex_handshake()))]
            .into_iter()
            .collect(),
    };
    let (manager, failures) = Manager::start(&config, options()).await;
    assert!(failures.is_empty());

    let uploader = manager.uploader("cortex").unwrap();

    let calls = (0..16).map(|firing| {
        let uploader = uploader.clone();
        async move {
            uploader
                .transform_to_alerts(TransformToAlerts {
                    provider_id: 3,
                    namespace_id: firing as u64,
                    body: alert_group(firing, 2),
                })
                .await
                .map(|t| (t.firing_count, t.alerts.len()))
        }
    });
    let results = futures::future::join_all(calls).await;

    for (firing, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), (firing, firing + 2));
    }

    // A malformed payload is the plugin's Invalid error, attributed to the plugin.
    let err = uploader
        .transform_to_alerts(TransformToAlerts {
            provider_id: 3,
            namespace_id: 1,
            body: json!({"alerts": "nope"}),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Invalid);
    assert!(
        err.to_string()
            .starts_with("invalid: plugin \"cortex\" transform_to_alerts: "),
        "{err}"
    );

    manager.stop().await;
    manager.stop().await; // No-op.

    assert!(manager.uploader("cortex").is_none());
    assert!(manager.keys().is_empty());

    // An uploader held across the stop fails as unavailable.
    let err = uploader.set_config(BTreeMap::new()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Unavailable);
    assert_eq!(
        err.to_string(),
        "unavailable: plugin \"cortex\" set_config: plugin connection is closed"
    );
}

#[tokio::test]
async fn test_plugin_exits_during_a_call() {
    let tmp = tempfile::tempdir().unwrap();
    let command = script(
        tmp.path(),
        "quitter",
        r#"echo '{"level":"ERROR","target":"quitter","fields":{"message":"giving up"}}' >&2
echo "1|json-lines"
read request
exit 3"#,
    );

    let client = Client::launch("quitter", &command, &cortex_handshake(), Duration::from_secs(10))
        .await
        .unwrap();
    let uploader = PluginUploader::new(Arc::new(client));

    let err = uploader.set_config(BTreeMap::new()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Unavailable);
    assert_eq!(
        err.to_string(),
        "unavailable: plugin \"quitter\" set_config: plugin connection is closed"
    );
}

#[tokio::test]
async fn test_unresponsive_plugin_is_killed() {
    let tmp = tempfile::tempdir().unwrap();
    let command = script(
        tmp.path(),
        "stubborn",
        r#"trap '' TERM
echo "1|json-lines"
while true; do sleep 1; done"#,
    );

    let client = Client::launch(
        "stubborn",
        &command,
        &cortex_handshake(),
        Duration::from_millis(200),
    )
    .await
    .unwrap();
    let client = Arc::new(client);
    let uploader = PluginUploader::new(client.clone());

    let err = uploader.set_config(BTreeMap::new()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Unavailable);
    assert_eq!(
        err.to_string(),
        "unavailable: plugin \"stubborn\" set_config: plugin call set_config didn't complete within 200ms"
    );

    // The plugin ignores SIGTERM, and is killed once its grace period elapses.
    let started = Instant::now();
    client.stop(Duration::from_millis(300)).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");

    let err = uploader.set_config(BTreeMap::new()).await.unwrap_err();
    assert!(err.to_string().ends_with("plugin connection is closed"), "{err}");
}
