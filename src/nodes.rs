//! Adding controllers to an existing cluster.

use crate::error::{ClusterError, Result};
use crate::probe::{ControllerUrl, Probe};
use crate::reconcile::NodeKey;
use crate::store::{NodeInsert, NodeRow, Store};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::thread;
use tracing::{debug, info};

pub const DEFAULT_WEIGHT: u8 = 5;

/// Values applied to every node added in one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDefaults {
    pub weight: u8,
    pub max_groups: u32,
    pub auth_user: String,
}

impl Default for NodeDefaults {
    fn default() -> Self {
        Self {
            weight: DEFAULT_WEIGHT,
            max_groups: crate::document::DEFAULT_MAX_GROUPS,
            auth_user: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub url: ControllerUrl,
    pub weight: u8,
    pub max_groups: u32,
    pub auth_user: String,
}

/// Parses every URL, then probes them. Nothing is returned unless every probe
/// succeeded; all failures are reported together.
///
/// Repeats of the same URL collapse to one. Two URLs for the same host and
/// port under different schemes are rejected.
///
/// A single URL is probed inline. Two or more get one thread each and are
/// joined before any decision is made.
pub fn acquire_nodes<P>(prober: &P, urls: &[String], defaults: &NodeDefaults) -> Result<Vec<NodeRecord>>
where
    P: Probe + Sync,
{
    let mut parsed: Vec<ControllerUrl> = Vec::with_capacity(urls.len());
    let mut seen: HashMap<NodeKey, usize> = HashMap::new();
    for raw in urls {
        let url: ControllerUrl = raw.parse()?;
        match seen.get(&NodeKey::new(&url.host, url.port)) {
            Some(&idx) if parsed[idx] == url => continue,
            Some(&idx) => {
                return Err(ClusterError::validation(format!(
                    "{} and {} point at the same controller",
                    parsed[idx], url
                )));
            }
            None => {
                seen.insert(NodeKey::new(&url.host, url.port), parsed.len());
                parsed.push(url);
            }
        }
    }
    if parsed.is_empty() {
        return Err(ClusterError::validation("no controller URLs given"));
    }

    let record = |url: ControllerUrl| NodeRecord {
        url,
        weight: defaults.weight,
        max_groups: defaults.max_groups,
        auth_user: defaults.auth_user.clone(),
    };

    if let [only] = parsed.as_slice() {
        prober.probe(only)?;
        return Ok(vec![record(only.clone())]);
    }

    let results = Mutex::new((Vec::new(), Vec::new()));
    thread::scope(|scope| {
        for url in &parsed {
            let results = &results;
            scope.spawn(move || {
                let outcome = prober.probe(url);
                let mut guard = results.lock().unwrap_or_else(|p| p.into_inner());
                match outcome {
                    Ok(()) => guard.0.push(url.clone()),
                    Err(err) => guard.1.push(err),
                }
            });
        }
    });
    let (reachable, failures) = results.into_inner().unwrap_or_else(|p| p.into_inner());
    debug!(ok = reachable.len(), failed = failures.len(), "probed controllers");

    if !failures.is_empty() {
        return Err(ClusterError::ProbesFailed { failures });
    }
    Ok(reachable.into_iter().map(record).collect())
}

/// Inserts the records under the named cluster in one transaction.
///
/// A node whose `(host, port)` is already present in the cluster, or appears
/// twice among `records`, is rejected before anything is written.
pub fn insert_into_cluster(
    store: &mut Store,
    cluster: &str,
    records: &[NodeRecord],
) -> Result<Vec<NodeRow>> {
    let row = store
        .find_cluster(cluster)?
        .ok_or_else(|| ClusterError::ClusterNotFound {
            name: cluster.trim().to_string(),
        })?;

    let mut taken: HashSet<NodeKey> = store
        .list_nodes()?
        .iter()
        .filter(|n| n.cluster_id == row.id)
        .map(|n| NodeKey::new(&n.host, n.port))
        .collect();
    if let Some(dup) = records
        .iter()
        .find(|r| !taken.insert(NodeKey::new(&r.url.host, r.url.port)))
    {
        return Err(ClusterError::validation(format!(
            "{} is already a node of cluster `{}`",
            dup.url, row.name
        )));
    }

    let inserts: Vec<NodeInsert> = records
        .iter()
        .map(|r| NodeInsert {
            cluster_id: row.id,
            protocol: r.url.protocol.clone(),
            host: r.url.host.clone(),
            port: r.url.port,
            weight: r.weight,
            max_groups: r.max_groups,
            auth_user: r.auth_user.trim().to_string(),
        })
        .collect();
    let inserted = store.insert_nodes(&inserts)?;
    info!(cluster = %row.name, count = inserted.len(), "added nodes");
    Ok(inserted)
}
