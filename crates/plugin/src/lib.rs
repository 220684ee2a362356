//! Provider plugins: RuleUploaders which run out of process.
//!
//! The host launches each configured plugin as a child process and negotiates
//! a handshake over its stdout, after which the plugin's stdin and stdout
//! carry a multiplexed JSON-lines RPC channel (see `protocol`). Plugin stderr
//! is forwarded into the host's own logs.
//!
//! `Manager` owns the launched plugins of a host, and `serve` is the
//! plugin-side counterpart which exposes a RuleUploader over the channel.

use std::path::PathBuf;
use std::time::Duration;

mod client;
mod codec;
mod manager;
mod process;
pub mod protocol;
mod serve;

pub use client::{Client, PluginUploader};
pub use manager::{Manager, Options};
pub use serve::serve;

/// Deadline by which a launched plugin must complete its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to launch plugin command {0:?}")]
    Launch(PathBuf, #[source] std::io::Error),
    #[error("plugin exited before completing its handshake ({status}): {stderr}")]
    HandshakeExited { status: String, stderr: String },
    #[error("plugin didn't complete its handshake within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("malformed plugin handshake {0:?}")]
    MalformedHandshake(String),
    #[error("incompatible plugin protocol version {actual} (expected {expected})")]
    ProtocolVersion { expected: u32, actual: u32 },
    #[error("unsupported plugin transport {0:?}")]
    Transport(String),
    #[error(
        "this binary is a provider plugin which must be launched by its host \
         (environment variable {0:?} doesn't hold the expected magic cookie)"
    )]
    MagicCookie(String),
    #[error("plugin connection is closed")]
    Closed,
    #[error("plugin call {method} didn't complete within {timeout:?}")]
    Deadline {
        method: protocol::Method,
        timeout: Duration,
    },
    #[error("i/o error on plugin connection")]
    Io(#[from] std::io::Error),
    #[error("failed to encode plugin message")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode plugin message")]
    Decode(#[source] serde_json::Error),
}

impl From<Error> for models::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Encode(_) | Error::Decode(_) => models::ErrorKind::Internal,
            _ => models::ErrorKind::Unavailable,
        };
        models::Error::new(kind, err)
    }
}
