//! Wire messages of the plugin RPC channel.
//!
//! Once a plugin has completed its handshake, the host writes `Request`s to the
//! plugin's stdin, and the plugin writes a `Response` to its stdout for each,
//! as newline-delimited JSON. Responses may arrive in any order and are matched
//! to their request by `id`:
//!
//! ```text
//! > {"id":1,"method":"set_config","params":{"group_wait":"30s"}}
//! > {"id":2,"method":"transform_to_alerts","params":{...}}
//! < {"id":2,"result":{"alerts":[],"firing_count":0}}
//! < {"id":1,"error":{"kind":"invalid","message":"invalid cortex service config: ..."}}
//! ```

use models::ErrorKind;
use serde::{Deserialize, Serialize};

/// Environment variable through which the host passes its protocol version.
pub const PROTOCOL_VERSION_ENV: &str = "PLUGIN_PROTOCOL_VERSION";

/// Transport named by the plugin in its handshake line.
pub const TRANSPORT: &str = "json-lines";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    UpsertRule,
    SyncRuntimeConfig,
    SetConfig,
    TransformToAlerts,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::UpsertRule => "upsert_rule",
            Self::SyncRuntimeConfig => "sync_runtime_config",
            Self::SetConfig => "set_config",
            Self::TransformToAlerts => "transform_to_alerts",
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: Method,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Result(serde_json::Value),
    Error(RemoteError),
}

/// An error returned by the plugin, which keeps its classification across the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&models::Error> for RemoteError {
    fn from(err: &models::Error) -> Self {
        Self {
            kind: err.kind,
            message: format!("{:#}", err.error),
        }
    }
}

impl From<RemoteError> for models::Error {
    fn from(RemoteError { kind, message }: RemoteError) -> Self {
        models::Error::new(kind, anyhow::anyhow!(message))
    }
}

/// Handshake line written by a plugin which speaks `protocol_version`.
pub fn handshake_line(protocol_version: u32) -> String {
    format!("{protocol_version}|{TRANSPORT}\n")
}
