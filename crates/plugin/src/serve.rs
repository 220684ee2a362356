use super::codec;
use super::protocol::{self, Method, Outcome, RemoteError, Request, Response};
use super::Error;
use models::Handshake;
use providers::RuleUploader;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Serve `uploader` as a provider plugin over this process's stdin and stdout.
///
/// The process must have been launched by a host which holds the same
/// `handshake`. Requests are served concurrently, and `serve` returns once
/// the host closes our stdin and outstanding requests have been answered.
pub async fn serve(handshake: &Handshake, uploader: Arc<dyn RuleUploader>) -> Result<(), Error> {
    let cookie = std::env::var(&handshake.magic_cookie_key).unwrap_or_default();
    if cookie != handshake.magic_cookie_value {
        return Err(Error::MagicCookie(handshake.magic_cookie_key.clone()));
    }
    if let Ok(host_version) = std::env::var(protocol::PROTOCOL_VERSION_ENV) {
        tracing::debug!(%host_version, protocol_version = handshake.protocol_version, "host protocol version");
    }

    serve_io(
        handshake.protocol_version,
        uploader,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

async fn serve_io<R, W>(
    protocol_version: u32,
    uploader: Arc<dyn RuleUploader>,
    reader: R,
    mut writer: W,
) -> Result<(), Error>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    writer
        .write_all(protocol::handshake_line(protocol_version).as_bytes())
        .await?;
    writer.flush().await?;

    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    let mut tasks = tokio::task::JoinSet::new();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                // Answer the request if we can at least tell which one it was.
                let Some(id) = request_id(&line) else {
                    tracing::error!(error = %err, %line, "discarding malformed request");
                    continue;
                };
                let error = models::Error::invalid(format!("malformed request: {err}"));
                write_response(&writer, id, Outcome::Error(RemoteError::from(&error))).await?;
                continue;
            }
        };

        let (uploader, writer) = (uploader.clone(), writer.clone());
        tasks.spawn(async move {
            let Request { id, method, params } = request;
            tracing::debug!(id, %method, "serving request");

            let outcome = match dispatch(uploader.as_ref(), method, params).await {
                Ok(result) => Outcome::Result(result),
                Err(err) => {
                    tracing::warn!(id, %method, error = %err, "request failed");
                    Outcome::Error(RemoteError::from(&err))
                }
            };
            write_response(&writer, id, outcome).await
        });
    }

    tracing::debug!(outstanding = tasks.len(), "host closed its end of the channel");

    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => (),
            Ok(Err(err)) => return Err(err),
            Err(join_err) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    join_err,
                )))
            }
        }
    }
    Ok(())
}

async fn dispatch(
    uploader: &dyn RuleUploader,
    method: Method,
    params: serde_json::Value,
) -> models::Result<serde_json::Value> {
    fn decode<T: serde::de::DeserializeOwned>(params: serde_json::Value) -> models::Result<T> {
        serde_json::from_value(params)
            .map_err(|err| models::Error::invalid(format!("invalid request parameters: {err}")))
    }

    let result = match method {
        Method::UpsertRule => serde_json::to_value(uploader.upsert_rule(decode(params)?).await?),
        Method::SyncRuntimeConfig => {
            serde_json::to_value(uploader.sync_runtime_config(decode(params)?).await?)
        }
        Method::SetConfig => serde_json::to_value(uploader.set_config(decode(params)?).await?),
        Method::TransformToAlerts => {
            serde_json::to_value(uploader.transform_to_alerts(decode(params)?).await?)
        }
    };
    result.map_err(|err| models::Error::new(models::ErrorKind::Internal, err))
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &tokio::sync::Mutex<W>,
    id: u64,
    outcome: Outcome,
) -> Result<(), Error> {
    let mut buf = Vec::new();
    codec::encode(&Response { id, outcome }, &mut buf).map_err(Error::Encode)?;

    let mut writer = writer.lock().await;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

fn request_id(line: &str) -> Option<u64> {
    #[derive(serde::Deserialize)]
    struct Id {
        id: u64,
    }
    serde_json::from_str::<Id>(line).ok().map(|Id { id }| id)
}

#[cfg(test)]
mod test {
    use super::*;
    use providers::{ServiceConfig, SyncRuntimeConfig, TransformToAlerts, Transformed, UpsertRule};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl RuleUploader for Recorder {
        async fn upsert_rule(&self, request: UpsertRule) -> models::Result<()> {
            self.calls.lock().unwrap().push(format!("upsert {}", request.namespace_urn));
            Err(models::Error::invalid("no rules here").context("cannot parse upserted rule"))
        }
        async fn sync_runtime_config(&self, request: SyncRuntimeConfig) -> models::Result<()> {
            self.calls.lock().unwrap().push(format!("sync {}", request.namespace_id));
            Ok(())
        }
        async fn set_config(&self, config: ServiceConfig) -> models::Result<()> {
            self.calls.lock().unwrap().push(format!("config {:?}", config.keys().collect::<Vec<_>>()));
            Ok(())
        }
        async fn transform_to_alerts(
            &self,
            request: TransformToAlerts,
        ) -> models::Result<Transformed> {
            self.calls.lock().unwrap().push(format!("transform {}", request.provider_id));
            Ok(Transformed {
                alerts: Vec::new(),
                firing_count: 3,
            })
        }
    }

    #[tokio::test]
    async fn test_serve_io_answers_each_request() {
        let request = |id: u64, method: &str, params: serde_json::Value| {
            json!({"id": id, "method": method, "params": params}).to_string()
        };
        let upsert = UpsertRule {
            namespace_urn: "odpf-billing".to_string(),
            ..Default::default()
        };
        let transform = TransformToAlerts {
            provider_id: 9,
            ..Default::default()
        };
        let sync = SyncRuntimeConfig {
            namespace_id: 4,
            ..Default::default()
        };

        let input = [
            request(1, "set_config", json!({"group_wait": "1m"})),
            String::new(),
            request(2, "sync_runtime_config", serde_json::to_value(&sync).unwrap()),
            request(3, "upsert_rule", serde_json::to_value(&upsert).unwrap()),
            request(4, "transform_to_alerts", serde_json::to_value(&transform).unwrap()),
            request(5, "transform_to_alerts", json!({"provider_id": "nine"})),
            r#"{"id": 6, "method": "explode"}"#.to_string(),
            "not even json".to_string(),
        ]
        .join("\n")
            + "\n";

        let recorder = Arc::new(Recorder::default());
        let (writer, mut output) = tokio::io::duplex(1 << 16);

        serve_io(7, recorder.clone(), input.as_bytes(), writer)
            .await
            .unwrap();

        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut output, &mut out)
            .await
            .unwrap();

        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("7|json-lines"));

        // Responses are written as requests complete, which may be out of order.
        let mut responses: Vec<serde_json::Value> = lines
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        responses.sort_by_key(|r| r["id"].as_u64());

        // Decoding errors of serde_json are summarized.
        for (index, prefix) in [(4, "invalid request parameters: "), (5, "malformed request: ")] {
            let message = &mut responses[index]["error"]["message"];
            assert!(message.as_str().unwrap().starts_with(prefix), "{message}");
            *message = json!(prefix.trim_end());
        }

        insta::assert_json_snapshot!(responses, @r###"
        [
          {
            "id": 1,
            "result": null
          },
          {
            "id": 2,
            "result": null
          },
          {
            "error": {
              "kind": "invalid",
              "message": "cannot parse upserted rule: no rules here"
            },
            "id": 3
          },
          {
            "id": 4,
            "result": {
              "alerts": [],
              "firing_count": 3
            }
          },
          {
            "error": {
              "kind": "invalid",
              "message": "invalid request parameters:"
            },
            "id": 5
          },
          {
            "error": {
              "kind": "invalid",
              "message": "malformed request:"
            },
            "id": 6
          }
        ]
        "###);

        let mut calls = recorder.calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(
            calls,
            [
                "config [\"group_wait\"]",
                "sync 4",
                "transform 9",
                "upsert odpf-billing",
            ]
        );
    }
}
