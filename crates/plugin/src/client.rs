use super::codec;
use super::process::{Child, ChildStdio};
use super::protocol::{self, Method, Outcome, Request, Response};
use super::{Error, HANDSHAKE_TIMEOUT};
use futures::StreamExt;
use models::Handshake;
use providers::{
    RuleUploader, ServiceConfig, SyncRuntimeConfig, TransformToAlerts, Transformed, UpsertRule,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;

/// Client is the host's connection to a launched plugin. Calls may be issued
/// concurrently, and are multiplexed over the plugin's stdin and stdout.
pub struct Client {
    key: String,
    child: Child,
    // None after the connection has been closed.
    stdin: tokio::sync::Mutex<Option<ChildStdio>>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    call_timeout: Duration,
    reader: tokio::task::JoinHandle<()>,
}

// Calls awaiting a response, by request id.
#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<Outcome>>,
}

fn lock(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Client {
    /// Launch the plugin `command` as provider plugin `key`, and complete its handshake.
    #[tracing::instrument(skip(handshake, call_timeout), err)]
    pub async fn launch(
        key: &str,
        command: &Path,
        handshake: &Handshake,
        call_timeout: Duration,
    ) -> Result<Self, Error> {
        let mut cmd = std::process::Command::new(command);
        cmd.env(&handshake.magic_cookie_key, &handshake.magic_cookie_value)
            .env(
                protocol::PROTOCOL_VERSION_ENV,
                handshake.protocol_version.to_string(),
            );

        let (child, pipes) =
            Child::spawn(&mut cmd).map_err(|err| Error::Launch(command.to_owned(), err))?;
        tracing::debug!(pid = child.id(), "started plugin process");

        let logs = tokio::spawn(forward_logs(key.to_string(), BufReader::new(pipes.stderr)));
        let mut stdout = BufReader::new(pipes.stdout);

        let handshake = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            read_handshake(&mut stdout, handshake.protocol_version),
        )
        .await;

        match handshake {
            Ok(Ok(())) => (),
            Ok(Err(Error::Closed)) => {
                // The plugin exited without a handshake. Report its final words.
                let status = match tokio::time::timeout(Duration::from_secs(1), child.wait()).await
                {
                    Ok(Ok(status)) => status.to_string(),
                    _ => "unknown exit status".to_string(),
                };
                let stderr = match tokio::time::timeout(Duration::from_secs(1), logs).await {
                    Ok(Ok(last)) => last,
                    _ => String::new(),
                };
                return Err(Error::HandshakeExited { status, stderr });
            }
            Ok(Err(err)) => return Err(err),
            Err(_elapsed) => return Err(Error::HandshakeTimeout(HANDSHAKE_TIMEOUT)),
        }

        let pending = Arc::new(Mutex::new(Pending::default()));
        let reader = tokio::spawn(read_responses(key.to_string(), stdout, pending.clone()));

        Ok(Self {
            key: key.to_string(),
            child,
            stdin: tokio::sync::Mutex::new(Some(pipes.stdin)),
            pending,
            next_id: AtomicU64::new(1),
            call_timeout,
            reader,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Call `method` of the plugin, returning its Outcome.
    pub async fn call(&self, method: Method, params: serde_json::Value) -> Result<Outcome, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(Error::Closed);
            }
            pending.waiters.insert(id, tx);
        }
        // Forget our waiter if we return early, time out, or are cancelled.
        let _waiter = Waiter {
            pending: &self.pending,
            id,
        };

        let mut buf = Vec::new();
        codec::encode(&Request { id, method, params }, &mut buf).map_err(Error::Encode)?;

        let exchange = async {
            self.write(&buf).await?;
            rx.await.map_err(|_| Error::Closed)
        };

        match tokio::time::timeout(self.call_timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => Err(Error::Deadline {
                method,
                timeout: self.call_timeout,
            }),
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<(), Error> {
        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(Error::Closed);
        };
        stdin.write_all(buf).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Close the plugin's stdin, after which further calls fail.
    /// A well-behaved plugin exits upon reading EOF.
    pub async fn close(&self) {
        self.stdin.lock().await.take();
        lock(&self.pending).closed = true;
    }

    /// Close the connection and terminate the plugin, killing it if it
    /// hasn't exited within `grace` of being signaled.
    pub async fn stop(&self, grace: Duration) {
        self.close().await;

        match self.child.terminate(grace).await {
            Ok(status) => tracing::info!(key = %self.key, %status, "stopped plugin"),
            Err(error) => tracing::error!(key = %self.key, ?error, "failed to stop plugin"),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct Waiter<'a> {
    pending: &'a Mutex<Pending>,
    id: u64,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        lock(self.pending).waiters.remove(&self.id);
    }
}

async fn read_handshake<R>(stdout: &mut R, expected: u32) -> Result<(), Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if stdout.read_line(&mut line).await? == 0 {
        return Err(Error::Closed);
    }
    let line = line.trim_end();

    let Some((version, transport)) = line.split_once('|') else {
        return Err(Error::MalformedHandshake(line.to_string()));
    };
    let actual: u32 = version
        .parse()
        .map_err(|_| Error::MalformedHandshake(line.to_string()))?;

    if actual != expected {
        Err(Error::ProtocolVersion { expected, actual })
    } else if transport != protocol::TRANSPORT {
        Err(Error::Transport(transport.to_string()))
    } else {
        Ok(())
    }
}

/// Dispatch responses read from the plugin's stdout to their waiting calls.
/// When stdout closes, the connection is marked as closed and all calls
/// still waiting fail.
async fn read_responses<R>(key: String, stdout: R, pending: Arc<Mutex<Pending>>)
where
    R: AsyncBufRead + Unpin,
{
    let responses = codec::read_messages::<Response, _>(stdout);
    tokio::pin!(responses);

    loop {
        match responses.next().await {
            Some(Ok(Response { id, outcome })) => {
                let waiter = lock(&pending).waiters.remove(&id);

                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(outcome);
                    }
                    None => tracing::warn!(%key, id, "plugin response has no waiting call"),
                }
            }
            Some(Err(error)) => {
                tracing::error!(%key, error = format!("{error:#}"), "failed to read plugin response");
                break;
            }
            None => {
                tracing::debug!(%key, "plugin closed its output");
                break;
            }
        }
    }

    let mut pending = lock(&pending);
    pending.closed = true;
    pending.waiters.clear();
}

/// Forward lines of the plugin's stderr into our own logs, returning the
/// rendering of its final line.
async fn forward_logs<R>(key: String, mut stderr: R) -> String
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut last = String::new();

    loop {
        line.clear();

        match stderr.read_line(&mut line).await {
            Err(error) => {
                tracing::error!(%key, %error, "failed to read plugin stderr");
                break;
            }
            Ok(0) => break, // Clean EOF.
            Ok(_) => (),
        }

        let line = line.trim_end();
        if !line.is_empty() {
            last = forward_log(&key, line);
        }
    }
    last
}

/// A structured log line written by a plugin's `tracing` JSON subscriber.
#[derive(serde::Deserialize)]
struct LogLine {
    level: String,
    #[serde(default)]
    fields: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    target: String,
}

fn forward_log(key: &str, line: &str) -> String {
    let Ok(LogLine {
        level,
        mut fields,
        target,
    }) = serde_json::from_str(line)
    else {
        // Unstructured output.
        tracing::warn!(plugin = %key, "{line}");
        return line.to_string();
    };

    let mut message = match fields.remove("message") {
        Some(serde_json::Value::String(message)) => message,
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let fields = serde_json::Value::Object(fields);

    match level.as_str() {
        "ERROR" => tracing::error!(plugin = %key, %target, %fields, "{message}"),
        "WARN" => tracing::warn!(plugin = %key, %target, %fields, "{message}"),
        "INFO" => tracing::info!(plugin = %key, %target, %fields, "{message}"),
        "DEBUG" => tracing::debug!(plugin = %key, %target, %fields, "{message}"),
        _ => tracing::trace!(plugin = %key, %target, %fields, "{message}"),
    }

    if let serde_json::Value::Object(fields) = fields {
        for (name, value) in fields {
            message.push_str(&format!(" {name}={value}"));
        }
    }
    message
}

/// PluginUploader is a RuleUploader which proxies each method to a plugin.
/// Errors of the plugin keep their kind, and gain the plugin's key.
#[derive(Clone)]
pub struct PluginUploader {
    client: Arc<Client>,
}

impl PluginUploader {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }

    async fn invoke<P, R>(&self, method: Method, params: P) -> models::Result<R>
    where
        P: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        self.try_invoke(method, params)
            .await
            .map_err(|err| err.context(format!("plugin {:?} {method}", self.client.key)))
    }

    async fn try_invoke<P, R>(&self, method: Method, params: P) -> models::Result<R>
    where
        P: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(Error::Encode)?;

        match self.client.call(method, params).await? {
            Outcome::Result(value) => Ok(serde_json::from_value(value).map_err(Error::Decode)?),
            Outcome::Error(remote) => Err(remote.into()),
        }
    }
}

#[async_trait::async_trait]
impl RuleUploader for PluginUploader {
    async fn upsert_rule(&self, request: UpsertRule) -> models::Result<()> {
        self.invoke(Method::UpsertRule, request).await
    }

    async fn sync_runtime_config(&self, request: SyncRuntimeConfig) -> models::Result<()> {
        self.invoke(Method::SyncRuntimeConfig, request).await
    }

    async fn set_config(&self, config: ServiceConfig) -> models::Result<()> {
        self.invoke(Method::SetConfig, config).await
    }

    async fn transform_to_alerts(&self, request: TransformToAlerts) -> models::Result<Transformed> {
        self.invoke(Method::TransformToAlerts, request).await
    }
}
