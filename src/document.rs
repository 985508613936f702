//! The human-editable `cluster_config.toml`.

use crate::error::{ClusterError, Result};
use crate::state;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

pub const DEFAULT_MAX_GROUPS: u32 = 3;
pub const DEFAULT_PROTOCOL: &str = "http";
pub const MAX_WEIGHT: u8 = 10;
pub const PROTOCOLS: [&str; 2] = ["http", "https"];

/// Lowercase with outer whitespace removed. Used for every equality check on
/// cluster names, hosts and protocols.
pub fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, rename = "cluster", skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<ClusterDoc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_max_groups")]
    pub default_max_groups: u32,
    #[serde(default = "default_protocol")]
    pub default_protocol: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_max_groups: DEFAULT_MAX_GROUPS,
            default_protocol: DEFAULT_PROTOCOL.to_string(),
        }
    }
}

fn default_max_groups() -> u32 {
    DEFAULT_MAX_GROUPS
}

fn default_protocol() -> String {
    DEFAULT_PROTOCOL.to_string()
}

impl Settings {
    /// Empty protocol falls back to `default_protocol`.
    pub fn protocol_or_default(&self, protocol: &str) -> String {
        let p = normalize(protocol);
        if p.is_empty() {
            normalize(&self.default_protocol)
        } else {
            p
        }
    }

    /// Zero means unset.
    pub fn max_groups_or_default(&self, max_groups: u32) -> u32 {
        if max_groups == 0 {
            self.default_max_groups
        } else {
            max_groups
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDoc {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "node", skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeDoc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDoc {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub weight: u8,
    #[serde(default)]
    pub max_groups: u32,
}

impl ClusterConfig {
    /// Reads and validates the file. A missing file is [`ClusterError::NoConfig`].
    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            state::read_atomic(path)?.ok_or_else(|| ClusterError::NoConfig(path.to_path_buf()))?;
        let text = String::from_utf8(bytes).map_err(|e| ClusterError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, origin: &Path) -> Result<Self> {
        let cfg: ClusterConfig = toml::from_str(text).map_err(|e| ClusterError::Parse {
            path: origin.to_path_buf(),
            message: e.message().to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let default_protocol = normalize(&self.settings.default_protocol);
        if !PROTOCOLS.contains(&default_protocol.as_str()) {
            return Err(ClusterError::validation(format!(
                "settings.default_protocol must be http or https, got `{}`",
                self.settings.default_protocol
            )));
        }
        for cluster in &self.clusters {
            if cluster.name.trim().is_empty() {
                return Err(ClusterError::validation("cluster name must not be empty"));
            }
            for node in &cluster.nodes {
                let at = format!("cluster `{}` node `{}:{}`", cluster.name, node.host, node.port);
                if node.host.trim().is_empty() {
                    return Err(ClusterError::validation(format!("{at}: host is empty")));
                }
                if node.port == 0 {
                    return Err(ClusterError::validation(format!(
                        "{at}: port must be between 1 and 65535"
                    )));
                }
                if node.weight > MAX_WEIGHT {
                    return Err(ClusterError::validation(format!(
                        "{at}: weight {} is outside 0..={MAX_WEIGHT}",
                        node.weight
                    )));
                }
                let protocol = normalize(&node.protocol);
                if !protocol.is_empty() && !PROTOCOLS.contains(&protocol.as_str()) {
                    return Err(ClusterError::validation(format!(
                        "{at}: protocol must be http or https, got `{}`",
                        node.protocol
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serializes exactly what is held, without canonicalizing.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// Writes the canonical form of this document.
    pub fn save(&self, path: &Path) -> Result<()> {
        let canonical = self.canonical();
        let text = canonical.to_toml()?;
        state::write_atomic(path, text.as_bytes())?;
        debug!(path = %path.display(), clusters = canonical.clusters.len(), "wrote cluster config");
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&ClusterDoc> {
        let wanted = normalize(name);
        self.clusters.iter().find(|c| normalize(&c.name) == wanted)
    }
}
