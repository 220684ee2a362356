//! Defines the `Error` type returned across crate boundaries, which pairs a
//! stable `ErrorKind` with a wrapped `anyhow::Error` holding the full cause
//! chain. Callers which need to map errors onto a coarse status (a transport,
//! the plugin wire protocol) switch on `kind` and never inspect message text.
//!
//! Crate-local error enums convert into `Error` with a fixed kind, and
//! `ErrorExt::with_kind` re-classifies anything convertible.

/// Stable classification of an `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An unknown template, namespace, provider, or rule.
    NotFound,
    /// A name collision on upsert.
    Conflict,
    /// Malformed template expression, rendered body, or input.
    Invalid,
    /// A referenced namespace or provider is inconsistent.
    Relation,
    /// Transport failures: remote backend, plugin launch, handshake, or RPC.
    Unavailable,
    /// The capability isn't registered or implemented.
    Unimplemented,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::Invalid => "invalid",
            Self::Relation => "relation",
            Self::Unavailable => "unavailable",
            Self::Unimplemented => "unimplemented",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {error:#}")]
pub struct Error {
    pub kind: ErrorKind,
    #[source]
    pub error: anyhow::Error,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, error: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            error: error.into(),
        }
    }

    pub fn not_found(message: impl std::fmt::Display) -> Self {
        Self::msg(ErrorKind::NotFound, message)
    }

    pub fn invalid(message: impl std::fmt::Display) -> Self {
        Self::msg(ErrorKind::Invalid, message)
    }

    pub fn unavailable(message: impl std::fmt::Display) -> Self {
        Self::msg(ErrorKind::Unavailable, message)
    }

    pub fn unimplemented(message: impl std::fmt::Display) -> Self {
        Self::msg(ErrorKind::Unimplemented, message)
    }

    fn msg(kind: ErrorKind, message: impl std::fmt::Display) -> Self {
        Self {
            kind,
            error: anyhow::anyhow!("{message}"),
        }
    }

    /// Wrap the error with additional context, keeping its kind.
    pub fn context<C>(self, context: C) -> Self
    where
        C: std::fmt::Display + Send + Sync + 'static,
    {
        Self {
            kind: self.kind,
            error: self.error.context(context),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        // Preserve the kind of an `Error` which was converted into anyhow
        // somewhere along the way.
        match error.downcast::<Error>() {
            Ok(err) => err,
            Err(error) => Self {
                kind: ErrorKind::Internal,
                error,
            },
        }
    }
}

pub trait ErrorExt {
    /// Classify this error with the given kind.
    fn with_kind(self, kind: ErrorKind) -> Error;
}

impl<E: Into<Error>> ErrorExt for E {
    fn with_kind(self, kind: ErrorKind) -> Error {
        let mut err: Error = self.into();
        err.kind = kind;
        err
    }
}
