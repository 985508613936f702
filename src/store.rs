//! The local SQLite database of clusters and their nodes.
//!
//! Every write runs in exactly one transaction; a failed statement rolls the
//! whole call back when the transaction is dropped uncommitted.

use crate::document::normalize;
use crate::error::{ClusterError, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = include_str!("schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterRow {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCluster {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRow {
    pub id: i64,
    pub cluster_id: i64,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub weight: u8,
    pub max_groups: u32,
    pub auth_user: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInsert {
    pub cluster_id: i64,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub weight: u8,
    pub max_groups: u32,
    pub auth_user: String,
}

/// The editable columns of a node row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFields {
    pub protocol: String,
    pub auth_user: String,
    pub weight: u8,
    pub max_groups: u32,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Opens the database, creating the file and its schema on first use.
    pub fn init_if_needed(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ClusterError::io(parent, e))?;
        }
        let fresh = !path.exists();
        let conn = Connection::open(path)?;
        let mut store = Self::configure(conn)?;
        if fresh || !store.has_schema()? {
            store.apply_schema()?;
            info!(path = %path.display(), "created cluster database");
        }
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let mut store = Self::configure(Connection::open_in_memory()?)?;
        store.apply_schema()?;
        Ok(store)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "opened cluster database");
        Ok(Self { conn })
    }

    fn has_schema(&self) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'clusters'",
                [],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn apply_schema(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(SCHEMA)?;
        tx.commit()?;
        Ok(())
    }

    pub fn cluster_exists(&self, name: &str) -> Result<bool> {
        Ok(self.find_cluster(name)?.is_some())
    }

    /// Looks a cluster up by normalized name.
    pub fn find_cluster(&self, name: &str) -> Result<Option<ClusterRow>> {
        let wanted = normalize(name);
        Ok(self
            .list_clusters()?
            .into_iter()
            .find(|c| normalize(&c.name) == wanted))
    }

    pub fn create_clusters(&mut self, clusters: &[NewCluster]) -> Result<Vec<ClusterRow>> {
        let tx = self.conn.transaction()?;
        let mut created = Vec::with_capacity(clusters.len());
        {
            let mut stmt = tx.prepare("INSERT INTO clusters (name, description) VALUES (?1, ?2)")?;
            for cluster in clusters {
                stmt.execute(params![cluster.name, cluster.description])?;
                created.push(ClusterRow {
                    id: tx.last_insert_rowid(),
                    name: cluster.name.clone(),
                    description: cluster.description.clone(),
                });
            }
        }
        tx.commit()?;
        debug!(count = created.len(), "inserted clusters");
        Ok(created)
    }

    pub fn insert_nodes(&mut self, nodes: &[NodeInsert]) -> Result<Vec<NodeRow>> {
        let tx = self.conn.transaction()?;
        let mut inserted = Vec::with_capacity(nodes.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO nodes (cluster_id, protocol, host, port, weight, max_groups, auth_user)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for n in nodes {
                stmt.execute(params![
                    n.cluster_id,
                    n.protocol,
                    n.host,
                    n.port,
                    n.weight,
                    n.max_groups,
                    n.auth_user
                ])?;
                inserted.push(NodeRow {
                    id: tx.last_insert_rowid(),
                    cluster_id: n.cluster_id,
                    protocol: n.protocol.clone(),
                    host: n.host.clone(),
                    port: n.port,
                    weight: n.weight,
                    max_groups: n.max_groups,
                    auth_user: n.auth_user.clone(),
                });
            }
        }
        tx.commit()?;
        debug!(count = inserted.len(), "inserted nodes");
        Ok(inserted)
    }

    /// Updates the node at `(host, port)` within the cluster. Returns the rows touched.
    pub fn update_node_fields(
        &mut self,
        cluster_id: i64,
        host: &str,
        port: u16,
        fields: &NodeFields,
    ) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE nodes SET protocol = ?1, auth_user = ?2, weight = ?3, max_groups = ?4
             WHERE cluster_id = ?5 AND lower(trim(host)) = ?6 AND port = ?7",
            params![
                fields.protocol,
                fields.auth_user,
                fields.weight,
                fields.max_groups,
                cluster_id,
                normalize(host),
                port
            ],
        )?;
        tx.commit()?;
        Ok(changed)
    }

    pub fn update_cluster_description(
        &mut self,
        cluster_id: i64,
        description: Option<&str>,
    ) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE clusters SET description = ?1 WHERE cluster_id = ?2",
            params![description, cluster_id],
        )?;
        tx.commit()?;
        Ok(changed)
    }

    pub fn list_clusters(&self) -> Result<Vec<ClusterRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT cluster_id, name, description FROM clusters ORDER BY cluster_id")?;
        let rows = stmt.query_map([], |row| {
            Ok(ClusterRow {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_nodes(&self) -> Result<Vec<NodeRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT node_id, cluster_id, protocol, host, port, weight, max_groups, auth_user
             FROM nodes ORDER BY cluster_id, node_id",
        )?;
        let rows = stmt.query_map([], node_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Clusters and nodes read back to back, the input every reconciliation starts from.
    pub fn snapshot(&self) -> Result<Snapshot> {
        Ok(Snapshot {
            clusters: self.list_clusters()?,
            nodes: self.list_nodes()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub clusters: Vec<ClusterRow>,
    pub nodes: Vec<NodeRow>,
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<NodeRow> {
    Ok(NodeRow {
        id: row.get(0)?,
        cluster_id: row.get(1)?,
        protocol: row.get(2)?,
        host: row.get(3)?,
        port: row.get(4)?,
        weight: row.get(5)?,
        max_groups: row.get(6)?,
        auth_user: row.get(7)?,
    })
}
