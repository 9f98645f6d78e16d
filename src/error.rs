// Error taxonomy shared by the sync pipeline, the manifest and the local cache.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HubError>;

#[derive(Debug, Error)]
pub enum HubError {
    /// The remote end could not be reached or the connection dropped.
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    /// The remote answered, but not with a usable response (non-2xx, bad headers).
    #[error("protocol failure: {0}")]
    ProtocolFailure(String),

    /// The body could not be received or written to its destination.
    #[error("data processing failure: {0}")]
    DataProcessingFailure(String),

    /// The per-request timeout fired before the caller cancelled.
    #[error("request to {url} timed out after {secs} seconds")]
    Timeout { url: String, secs: u64 },

    #[error("operation cancelled")]
    Cancelled,

    /// One or more downloaded bundles failed integrity verification.
    #[error("asset bundle broken: {}", .0.join(", "))]
    AssetBundleBroken(Vec<String>),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bundle not downloaded: {0}")]
    NotDownloaded(String),

    #[error("type mismatch for {name}: requested {requested}")]
    TypeMismatch {
        name: String,
        requested: &'static str,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("dependency cycle: {}", .path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    /// A coalesced in-flight load this caller waited on failed.
    #[error("in-flight load of {name} failed: {reason}")]
    LoadFailed { name: String, reason: String },

    #[error("failed to open {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HubError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HubError::Io {
            path: path.into(),
            source,
        }
    }

    /// Transport-layer failures abort the remaining fetches of a run.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            HubError::ConnectionFailure(_)
                | HubError::ProtocolFailure(_)
                | HubError::DataProcessingFailure(_)
                | HubError::Timeout { .. }
        )
    }
}
