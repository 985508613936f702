//! Access tokens per controller, one JSON object per line.
//!
//! Entries are matched on the host alone: scheme and port are ignored, so
//! `http://lab:3080` and `https://lab:443` share a single entry.

use crate::error::{ClusterError, Result};
use crate::state::{self, KEY_FILE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub server_url: String,
    pub user: String,
    pub access_token: String,
    pub token_type: String,
}

#[derive(Debug, Clone)]
pub struct Keyring {
    path: PathBuf,
    entries: Vec<KeyEntry>,
}

impl Keyring {
    /// Loads the keyring at `path`; a missing file is an empty keyring.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = load(&path)?;
        Ok(Self { path, entries })
    }

    /// Resolves a `--key-file` override. A directory means `<dir>/gns3key`.
    pub fn location(default: PathBuf, key_file: Option<&Path>) -> PathBuf {
        match key_file {
            None => default,
            Some(custom) => {
                let expanded = state::expand_home(custom);
                if expanded.is_dir() {
                    expanded.join(KEY_FILE)
                } else {
                    expanded
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[KeyEntry] {
        &self.entries
    }

    pub fn lookup(&self, url: &str) -> Option<&KeyEntry> {
        let wanted = host_key(url);
        self.entries.iter().find(|e| host_key(&e.server_url) == wanted)
    }

    pub fn token_for(&self, url: &str) -> Option<&str> {
        self.lookup(url).map(|e| e.access_token.as_str())
    }

    /// Replaces the entry for the same host or appends a new one, then rewrites the file.
    pub fn upsert(&mut self, entry: KeyEntry) -> Result<()> {
        let wanted = host_key(&entry.server_url);
        match self
            .entries
            .iter_mut()
            .find(|e| host_key(&e.server_url) == wanted)
        {
            Some(existing) => {
                if existing.server_url != entry.server_url {
                    warn!(
                        stored = %existing.server_url,
                        new = %entry.server_url,
                        "replacing keyring entry for the same host with a different scheme or port"
                    );
                }
                *existing = entry;
            }
            None => self.entries.push(entry),
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        let mut out = String::new();
        for entry in &self.entries {
            let line = serde_json::to_string(entry).map_err(|source| ClusterError::Keyring {
                path: self.path.clone(),
                line: 0,
                source,
            })?;
            out.push_str(&line);
            out.push('\n');
        }
        state::write_atomic(&self.path, out.as_bytes())?;
        debug!(path = %self.path.display(), entries = self.entries.len(), "saved keyring");
        Ok(())
    }
}

pub fn load(path: &Path) -> Result<Vec<KeyEntry>> {
    let Some(bytes) = state::read_atomic(path)? else {
        return Ok(Vec::new());
    };
    let text = String::from_utf8(bytes).map_err(|e| {
        ClusterError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })?;
    let mut entries = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(line).map_err(|source| ClusterError::Keyring {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Strips a leading `http://`/`https://` and everything from the first `:` on.
/// Hostnames compare case-insensitively, so the result is lowercased.
pub fn host_key(url: &str) -> String {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    let host = match rest.find(':') {
        Some(idx) => &rest[..idx],
        None => rest,
    };
    host.to_ascii_lowercase()
}
