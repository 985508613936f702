use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("could not locate a home directory for the current user (set GNS3CTL_HOME)")]
    MissingHomeDir,
    #[error("no cluster config found at {}; run `gns3ctl cluster config sync` to generate one", .0.display())]
    NoConfig(PathBuf),
    #[error("a cluster named `{name}` already exists")]
    ClusterExists { name: String },
    #[error("cluster `{name}` not found")]
    ClusterNotFound { name: String },
    #[error("failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("can't connect to {url}")]
    Unreachable { url: String },
    #[error("{url} rejected the access token; log in to it again")]
    Unauthorized { url: String },
    #[error("no access token for {url}; log in first or pass --user/--password")]
    NoToken { url: String },
    #[error("{} controller(s) failed: {}", .failures.len(), join(.failures))]
    ProbesFailed { failures: Vec<ClusterError> },
    #[error("{0}")]
    Validation(String),
    #[error("malformed keyring entry in {} on line {line}", .path.display())]
    Keyring {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing cluster config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("database error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ClusterError {
    pub fn validation(message: impl Into<String>) -> Self {
        ClusterError::Validation(message.into())
    }

    pub fn io(path: &Path, source: std::io::Error) -> Self {
        ClusterError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn join(failures: &[ClusterError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
