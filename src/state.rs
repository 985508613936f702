//! Per-user state directory and the file primitives every other store builds on.

use crate::error::{ClusterError, Result};
use dirs::home_dir;
use std::io::{ErrorKind, Write};
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::debug;

pub const STATE_DIR_ENV: &str = "GNS3CTL_HOME";
pub const DB_FILE: &str = "clusterData.db";
pub const CONFIG_FILE: &str = "cluster_config.toml";
pub const KEY_FILE: &str = "gns3key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// `$GNS3CTL_HOME` when set, otherwise `~/.gns3`. The directory is created if missing.
    pub fn locate() -> Result<Self> {
        let root = match env::var_os(STATE_DIR_ENV) {
            Some(custom) if !custom.is_empty() => PathBuf::from(custom),
            _ => home_dir().ok_or(ClusterError::MissingHomeDir)?.join(".gns3"),
        };
        let state = Self::at(root);
        state.ensure()?;
        Ok(state)
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn db_path(&self) -> PathBuf {
        self.resolve(DB_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.resolve(CONFIG_FILE)
    }

    pub fn keyring_path(&self) -> PathBuf {
        self.resolve(KEY_FILE)
    }

    fn ensure(&self) -> Result<()> {
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(ClusterError::validation(format!(
                "{} already exists and is not a directory",
                self.root.display()
            ))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&self.root).map_err(|e| ClusterError::io(&self.root, e))
            }
            Err(e) => Err(ClusterError::io(&self.root, e)),
        }
    }
}

/// Reads the whole file, `None` when it does not exist.
pub fn read_atomic(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ClusterError::io(path, e)),
    }
}

/// Writes through a sibling temp file and renames it over `path`, so readers
/// only ever observe the old or the new contents.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|e| ClusterError::io(&parent, e))?;

    let mut tmp = NamedTempFile::new_in(&parent).map_err(|e| ClusterError::io(&parent, e))?;
    tmp.write_all(bytes).map_err(|e| ClusterError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| ClusterError::io(tmp.path(), e))?;
    set_mode(tmp.path())?;
    tmp.persist(path)
        .map_err(|e| ClusterError::io(path, e.error))?;
    debug!(path = %path.display(), len = bytes.len(), "wrote file");
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
        .map_err(|e| ClusterError::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path) -> Result<()> {
    Ok(())
}

/// Expands a leading `~` the way a shell would.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}
