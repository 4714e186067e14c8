//! Error taxonomy for the platform API.
//!
//! HTTP status codes are translated into typed errors once, in the Core, so
//! that callers can branch on the error kind instead of re-parsing messages.
//! Transport-level failures (DNS, TCP, TLS) are never translated; they carry
//! the underlying reqwest error unchanged.

use thiserror::Error;

/// Errno-style code preserved from the server payload or produced by local
/// filesystem validation, so callers can pattern-match the exact condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsCode {
    Enoent,
    Eexist,
    Enotdir,
    Eisdir,
}

impl OsCode {
    pub fn errno(self) -> i32 {
        match self {
            OsCode::Enoent => 2,
            OsCode::Eexist => 17,
            OsCode::Enotdir => 20,
            OsCode::Eisdir => 21,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OsCode::Enoent => "ENOENT",
            OsCode::Eexist => "EEXIST",
            OsCode::Enotdir => "ENOTDIR",
            OsCode::Eisdir => "EISDIR",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ENOENT" => Some(OsCode::Enoent),
            "EEXIST" => Some(OsCode::Eexist),
            "ENOTDIR" => Some(OsCode::Enotdir),
            "EISDIR" => Some(OsCode::Eisdir),
            _ => None,
        }
    }
}

impl std::fmt::Display for OsCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OS-style error with a preserved errno, mirroring what local filesystem
/// calls would report for the same condition.
#[derive(Debug, Clone, Error)]
#[error("[{code}] {message}")]
pub struct OsError {
    pub code: OsCode,
    pub message: String,
}

impl OsError {
    pub fn new(code: OsCode, message: impl Into<String>, path: impl AsRef<str>) -> Self {
        Self {
            code,
            message: format!("{}: {}", message.into(), path.as_ref()),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request or bad input (HTTP 400 without a recognized errno).
    #[error("{0}")]
    IllegalArgument(String),
    /// Invalid or expired credentials (HTTP 401).
    #[error("{0}")]
    Authentication(String),
    /// Insufficient permission (HTTP 403).
    #[error("{0}")]
    Authorization(String),
    /// Missing resource (HTTP 404). Some callers treat this as control flow,
    /// e.g. existence checks before mkdir.
    #[error("{0}")]
    NotFound(String),
    /// Generic client fault (HTTP 405 and similar).
    #[error("{0}")]
    Client(String),
    /// HTTP 502.
    #[error("{0}")]
    BadGateway(String),
    /// HTTP 503.
    #[error("{0}")]
    ServerNotAvailable(String),
    /// Errno-carrying failure, from a 400 payload or local validation.
    #[error(transparent)]
    Os(#[from] OsError),
    /// Network-level failure, propagated from the HTTP client untranslated.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    /// WebSocket failure below the HTTP handshake level.
    #[error(transparent)]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Translate an HTTP error response into a taxonomy entry.
    ///
    /// The message is the `error` field of a JSON payload when present, the
    /// raw body text otherwise, or `"<status>: <reason>"` for an empty body.
    /// A 400 payload naming a recognized errno becomes an [`OsError`] instead.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let mut message = body.to_string();
        let mut errno = None;
        if let Ok(serde_json::Value::Object(payload)) = serde_json::from_str(body) {
            if let Some(err) = payload.get("error").and_then(|v| v.as_str()) {
                message = err.to_string();
            }
            errno = payload
                .get("errno")
                .and_then(|v| v.as_str())
                .and_then(OsCode::from_name);
        }
        if message.is_empty() {
            message = format!(
                "{}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            );
        }
        if status == reqwest::StatusCode::BAD_REQUEST {
            if let Some(code) = errno {
                return Error::Os(OsError { code, message });
            }
        }
        match status.as_u16() {
            400 => Error::IllegalArgument(message),
            401 => Error::Authentication(message),
            403 => Error::Authorization(message),
            404 => Error::NotFound(message),
            405 => Error::Client(message),
            502 => Error::BadGateway(message),
            503 => Error::ServerNotAvailable(message),
            _ => Error::IllegalArgument(message),
        }
    }

    /// Returns true for failure classes worth retrying at the file-transfer
    /// granularity: transport drops and upstream 502/503 responses.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::BadGateway(_) | Error::ServerNotAvailable(_)
        )
    }
}
