//! Reconciliation between the cluster config file and the database.
//!
//! Both sides are first reduced to a [`View`]: clusters keyed by normalized
//! name, nodes keyed by normalized `(host, port)`, every field already
//! defaulted from `[settings]`. All comparisons happen on views, so an empty
//! protocol and an explicit `default_protocol` are indistinguishable.
//!
//! Nothing here ever deletes a row. The create delta is purely additive and
//! the update pass only touches rows that already exist.

use crate::document::{ClusterConfig, ClusterDoc, NodeDoc, Settings, normalize};
use crate::error::{ClusterError, Result};
use crate::store::{NewCluster, NodeFields, NodeInsert, Snapshot, Store};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeKey {
    pub host: String,
    pub port: u16,
}

impl NodeKey {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: normalize(host),
            port,
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    pub protocol: String,
    pub weight: u8,
    pub max_groups: u32,
    pub auth_user: String,
}

impl NodeView {
    fn from_doc(node: &NodeDoc, settings: &Settings) -> Self {
        Self {
            protocol: settings.protocol_or_default(&node.protocol),
            weight: node.weight,
            max_groups: settings.max_groups_or_default(node.max_groups),
            auth_user: node.user.trim().to_string(),
        }
    }

    fn fields(&self) -> NodeFields {
        NodeFields {
            protocol: self.protocol.clone(),
            auth_user: self.auth_user.clone(),
            weight: self.weight,
            max_groups: self.max_groups,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    /// First spelling seen, trimmed. Used when the cluster has to be created.
    pub display_name: String,
    pub description: String,
    pub nodes: BTreeMap<NodeKey, NodeView>,
}

pub type View = BTreeMap<String, ClusterView>;

fn same_text(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// Builds the config side. Later duplicates of a node key are ignored; the
/// second return value reports whether any were seen.
fn doc_view_counting(cfg: &ClusterConfig) -> (View, bool) {
    let mut view = View::new();
    let mut duplicates = false;
    for cluster in &cfg.clusters {
        let entry = view
            .entry(normalize(&cluster.name))
            .or_insert_with(|| ClusterView {
                display_name: cluster.name.trim().to_string(),
                description: String::new(),
                nodes: BTreeMap::new(),
            });
        if entry.description.is_empty() {
            entry.description = cluster.description.trim().to_string();
        }
        for node in &cluster.nodes {
            let key = NodeKey::new(&node.host, node.port);
            if entry.nodes.contains_key(&key) {
                duplicates = true;
                continue;
            }
            entry.nodes.insert(key, NodeView::from_doc(node, &cfg.settings));
        }
    }
    (view, duplicates)
}

pub fn doc_view(cfg: &ClusterConfig) -> View {
    doc_view_counting(cfg).0
}

pub fn store_view(settings: &Settings, snapshot: &Snapshot) -> View {
    let mut view = View::new();
    let mut names = HashMap::with_capacity(snapshot.clusters.len());
    for cluster in &snapshot.clusters {
        let name = normalize(&cluster.name);
        names.insert(cluster.id, name.clone());
        view.insert(
            name,
            ClusterView {
                display_name: cluster.name.trim().to_string(),
                description: cluster
                    .description
                    .as_deref()
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
                nodes: BTreeMap::new(),
            },
        );
    }
    for node in &snapshot.nodes {
        let Some(entry) = names.get(&node.cluster_id).and_then(|n| view.get_mut(n)) else {
            continue;
        };
        entry
            .nodes
            .entry(NodeKey::new(&node.host, node.port))
            .or_insert_with(|| NodeView {
                protocol: settings.protocol_or_default(&node.protocol),
                weight: node.weight,
                max_groups: settings.max_groups_or_default(node.max_groups),
                auth_user: node.auth_user.trim().to_string(),
            });
    }
    view
}

fn view_to_config(settings: &Settings, view: View) -> ClusterConfig {
    let clusters = view
        .into_iter()
        .map(|(name, cluster)| ClusterDoc {
            name,
            description: cluster.description,
            nodes: cluster
                .nodes
                .into_iter()
                .map(|(key, node)| NodeDoc {
                    host: key.host,
                    port: key.port,
                    user: node.auth_user,
                    protocol: node.protocol,
                    weight: node.weight,
                    max_groups: node.max_groups,
                })
                .collect(),
        })
        .collect();
    ClusterConfig {
        settings: Settings {
            default_max_groups: settings.default_max_groups,
            default_protocol: settings.protocol_or_default(""),
        },
        clusters,
    }
}

impl ClusterConfig {
    /// Trimmed, lowercased, defaulted, deduplicated and sorted: clusters by
    /// normalized name, nodes by `(host, port)`.
    pub fn canonical(&self) -> ClusterConfig {
        view_to_config(&self.settings, doc_view(self))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    ClusterOnlyInConfig {
        cluster: String,
    },
    ClusterOnlyInStore {
        cluster: String,
    },
    Description {
        cluster: String,
        config: String,
        store: String,
    },
    NodeOnlyInConfig {
        cluster: String,
        node: NodeKey,
    },
    NodeOnlyInStore {
        cluster: String,
        node: NodeKey,
    },
    Field {
        cluster: String,
        node: NodeKey,
        field: &'static str,
        config: String,
        store: String,
    },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::ClusterOnlyInConfig { cluster } => {
                write!(f, "cluster {cluster:?} exists in config but not in DB")
            }
            Mismatch::ClusterOnlyInStore { cluster } => {
                write!(f, "cluster {cluster:?} exists in DB but not in config")
            }
            Mismatch::Description {
                cluster,
                config,
                store,
            } => write!(
                f,
                "cluster {cluster:?} description differs. cfg={config:?} db={store:?}"
            ),
            Mismatch::NodeOnlyInConfig { cluster, node } => {
                write!(f, "cluster {cluster:?} node {node} exists in config but not in DB")
            }
            Mismatch::NodeOnlyInStore { cluster, node } => {
                write!(f, "cluster {cluster:?} node {node} exists in DB but not in config")
            }
            Mismatch::Field {
                cluster,
                node,
                field,
                config,
                store,
            } => write!(
                f,
                "cluster {cluster:?} node {node} {field} differs. cfg={config:?} db={store:?}"
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub mismatches: Vec<Mismatch>,
}

impl CheckReport {
    pub fn in_sync(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Compares the config against a database snapshot without touching either.
pub fn check(cfg: &ClusterConfig, snapshot: &Snapshot) -> CheckReport {
    let cfg_view = doc_view(cfg);
    let db_view = store_view(&cfg.settings, snapshot);
    let mut mismatches = Vec::new();

    for name in cfg_view.keys().filter(|n| !db_view.contains_key(*n)) {
        mismatches.push(Mismatch::ClusterOnlyInConfig {
            cluster: name.clone(),
        });
    }
    for name in db_view.keys().filter(|n| !cfg_view.contains_key(*n)) {
        mismatches.push(Mismatch::ClusterOnlyInStore {
            cluster: name.clone(),
        });
    }

    for (name, cv) in &cfg_view {
        let Some(dv) = db_view.get(name) else {
            continue;
        };
        if cv.description != dv.description {
            mismatches.push(Mismatch::Description {
                cluster: name.clone(),
                config: cv.description.clone(),
                store: dv.description.clone(),
            });
        }
        for key in cv.nodes.keys().filter(|k| !dv.nodes.contains_key(*k)) {
            mismatches.push(Mismatch::NodeOnlyInConfig {
                cluster: name.clone(),
                node: key.clone(),
            });
        }
        for key in dv.nodes.keys().filter(|k| !cv.nodes.contains_key(*k)) {
            mismatches.push(Mismatch::NodeOnlyInStore {
                cluster: name.clone(),
                node: key.clone(),
            });
        }
        for (key, cn) in &cv.nodes {
            let Some(dn) = dv.nodes.get(key) else {
                continue;
            };
            let mut field = |field: &'static str, config: String, store: String| {
                mismatches.push(Mismatch::Field {
                    cluster: name.clone(),
                    node: key.clone(),
                    field,
                    config,
                    store,
                })
            };
            if !same_text(&cn.protocol, &dn.protocol) {
                field("protocol", cn.protocol.clone(), dn.protocol.clone());
            }
            if cn.weight != dn.weight {
                field("weight", cn.weight.to_string(), dn.weight.to_string());
            }
            if cn.max_groups != dn.max_groups {
                field(
                    "max_groups",
                    cn.max_groups.to_string(),
                    dn.max_groups.to_string(),
                );
            }
            if !same_text(&cn.auth_user, &dn.auth_user) {
                field("user", cn.auth_user.clone(), dn.auth_user.clone());
            }
        }
    }

    CheckReport { mismatches }
}

/// Folds the database into the config.
///
/// Every cluster and node present on either side ends up in the result. The
/// config's own values win wherever it has them; a description is taken from
/// the database only when the config has none. `changed` is true exactly when
/// the result differs from `cfg` as given.
pub fn merge(cfg: &ClusterConfig, snapshot: &Snapshot) -> (ClusterConfig, bool) {
    let (mut view, duplicates) = doc_view_counting(cfg);
    let db_view = store_view(&cfg.settings, snapshot);

    for (name, dv) in db_view {
        match view.get_mut(&name) {
            None => {
                view.insert(name, dv);
            }
            Some(cv) => {
                if cv.description.is_empty() && !dv.description.is_empty() {
                    cv.description = dv.description;
                }
                for (key, node) in dv.nodes {
                    cv.nodes.entry(key).or_insert(node);
                }
            }
        }
    }

    let merged = view_to_config(&cfg.settings, view);
    let changed = merged != *cfg;
    debug!(changed, duplicates, clusters = merged.clusters.len(), "merged config with database");
    (merged, changed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNode {
    pub key: NodeKey,
    pub node: NodeView,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCluster {
    /// `None` when the cluster itself has to be created first.
    pub existing_id: Option<i64>,
    pub name: String,
    pub description: Option<String>,
    pub nodes: Vec<PendingNode>,
}

/// Rows the database is missing, in canonical order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateDelta {
    pub clusters: Vec<PendingCluster>,
}

impl CreateDelta {
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn new_clusters(&self) -> usize {
        self.clusters
            .iter()
            .filter(|c| c.existing_id.is_none())
            .count()
    }

    pub fn new_nodes(&self) -> usize {
        self.clusters.iter().map(|c| c.nodes.len()).sum()
    }
}

/// Plans the inserts that make the database contain everything in `cfg`.
///
/// Nodes are matched on `(host, port)` within their cluster, the same key the
/// check and update pass use, so a protocol change is an update and never a
/// second row for the same endpoint.
pub fn create_delta(cfg: &ClusterConfig, snapshot: &Snapshot) -> CreateDelta {
    let cfg_view = doc_view(cfg);

    let mut ids = HashMap::with_capacity(snapshot.clusters.len());
    for cluster in &snapshot.clusters {
        ids.insert(normalize(&cluster.name), cluster.id);
    }
    let existing: HashSet<(i64, NodeKey)> = snapshot
        .nodes
        .iter()
        .map(|n| (n.cluster_id, NodeKey::new(&n.host, n.port)))
        .collect();

    let mut delta = CreateDelta::default();
    for (name, cv) in cfg_view {
        let existing_id = ids.get(&name).copied();
        let mut seen = HashSet::new();
        let nodes: Vec<PendingNode> = cv
            .nodes
            .into_iter()
            .filter(|(key, _)| match existing_id {
                Some(id) => !existing.contains(&(id, key.clone())),
                None => true,
            })
            .filter(|(key, node)| seen.insert((node.protocol.clone(), key.clone())))
            .map(|(key, node)| PendingNode { key, node })
            .collect();

        if existing_id.is_some() && nodes.is_empty() {
            continue;
        }
        delta.clusters.push(PendingCluster {
            existing_id,
            name: cv.display_name,
            description: Some(cv.description).filter(|d| !d.is_empty()),
            nodes,
        });
    }
    delta
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaOutcome {
    pub clusters_created: usize,
    pub nodes_created: usize,
}

/// Pairs each pending node with its cluster id. New clusters take their ids
/// from `created`, in order; running out of ids is an error.
fn node_inserts(
    clusters: Vec<PendingCluster>,
    created: impl IntoIterator<Item = i64>,
) -> Result<Vec<NodeInsert>> {
    let mut created = created.into_iter();
    let mut inserts = Vec::new();
    for pending in clusters {
        let cluster_id = match pending.existing_id {
            Some(id) => id,
            None => created.next().ok_or_else(|| {
                ClusterError::validation(format!(
                    "database returned no row for new cluster `{}`",
                    pending.name
                ))
            })?,
        };
        for PendingNode { key, node } in pending.nodes {
            inserts.push(NodeInsert {
                cluster_id,
                protocol: node.protocol,
                host: key.host,
                port: key.port,
                weight: node.weight,
                max_groups: node.max_groups,
                auth_user: node.auth_user,
            });
        }
    }
    Ok(inserts)
}

/// Creates the missing clusters, then inserts the pending nodes with their
/// cluster ids filled in. Two transactions, clusters first.
pub fn execute_delta(store: &mut Store, delta: CreateDelta) -> Result<DeltaOutcome> {
    if delta.is_empty() {
        return Ok(DeltaOutcome::default());
    }
    let to_create: Vec<NewCluster> = delta
        .clusters
        .iter()
        .filter(|c| c.existing_id.is_none())
        .map(|c| NewCluster {
            name: c.name.clone(),
            description: c.description.clone(),
        })
        .collect();
    let created = store.create_clusters(&to_create)?;
    let inserts = node_inserts(delta.clusters, created.iter().map(|row| row.id))?;
    if !inserts.is_empty() {
        store.insert_nodes(&inserts)?;
    }

    let outcome = DeltaOutcome {
        clusters_created: to_create.len(),
        nodes_created: inserts.len(),
    };
    info!(
        clusters = outcome.clusters_created,
        nodes = outcome.nodes_created,
        "created missing rows"
    );
    Ok(outcome)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Description {
        cluster_id: i64,
        cluster: String,
        description: String,
    },
    Node {
        cluster_id: i64,
        cluster: String,
        key: NodeKey,
        fields: NodeFields,
    },
}

/// Field-level changes for clusters and nodes present on both sides.
///
/// A description is only pushed when the config has one; an empty config
/// description means "not specified" and never clears the database.
pub fn update_plan(cfg: &ClusterConfig, snapshot: &Snapshot) -> Vec<Update> {
    let cfg_view = doc_view(cfg);
    let db_view = store_view(&cfg.settings, snapshot);
    let ids: HashMap<String, i64> = snapshot
        .clusters
        .iter()
        .map(|c| (normalize(&c.name), c.id))
        .collect();

    let mut plan = Vec::new();
    for (name, cv) in &cfg_view {
        let (Some(dv), Some(&cluster_id)) = (db_view.get(name), ids.get(name)) else {
            continue;
        };
        if !cv.description.is_empty() && cv.description != dv.description {
            plan.push(Update::Description {
                cluster_id,
                cluster: name.clone(),
                description: cv.description.clone(),
            });
        }
        for (key, cn) in &cv.nodes {
            let Some(dn) = dv.nodes.get(key) else {
                continue;
            };
            let differs = !same_text(&cn.protocol, &dn.protocol)
                || cn.weight != dn.weight
                || cn.max_groups != dn.max_groups
                || !same_text(&cn.auth_user, &dn.auth_user);
            if differs {
                plan.push(Update::Node {
                    cluster_id,
                    cluster: name.clone(),
                    key: key.clone(),
                    fields: cn.fields(),
                });
            }
        }
    }
    plan
}

/// Runs each update in its own transaction. Returns how many statements ran.
pub fn execute_updates(store: &mut Store, plan: &[Update]) -> Result<usize> {
    for update in plan {
        match update {
            Update::Description {
                cluster_id,
                cluster,
                description,
            } => {
                store.update_cluster_description(*cluster_id, Some(description))?;
                debug!(%cluster, "updated description");
            }
            Update::Node {
                cluster_id,
                cluster,
                key,
                fields,
            } => {
                store.update_node_fields(*cluster_id, &key.host, key.port, fields)?;
                debug!(%cluster, node = %key, "updated node");
            }
        }
    }
    Ok(plan.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ClusterRow, NodeRow};

    fn doc_node(host: &str, port: u16, protocol: &str, weight: u8, max_groups: u32) -> NodeDoc {
        NodeDoc {
            host: host.into(),
            port,
            user: "u".into(),
            protocol: protocol.into(),
            weight,
            max_groups,
        }
    }

    fn cfg(clusters: Vec<ClusterDoc>) -> ClusterConfig {
        ClusterConfig {
            settings: Settings::default(),
            clusters,
        }
    }

    fn cluster_doc(name: &str, description: &str, nodes: Vec<NodeDoc>) -> ClusterDoc {
        ClusterDoc {
            name: name.into(),
            description: description.into(),
            nodes,
        }
    }

    fn db_cluster(id: i64, name: &str, description: Option<&str>) -> ClusterRow {
        ClusterRow {
            id,
            name: name.into(),
            description: description.map(Into::into),
        }
    }

    fn db_node(id: i64, cluster_id: i64, host: &str, port: u16) -> NodeRow {
        NodeRow {
            id,
            cluster_id,
            protocol: "http".into(),
            host: host.into(),
            port,
            weight: 5,
            max_groups: 3,
            auth_user: "u".into(),
        }
    }

    fn snapshot(clusters: Vec<ClusterRow>, nodes: Vec<NodeRow>) -> Snapshot {
        Snapshot { clusters, nodes }
    }

    #[test]
    fn empty_config_and_empty_db_are_in_sync() {
        let empty = ClusterConfig::default();
        let db = Snapshot::default();
        assert!(check(&empty, &db).in_sync());
        let (merged, changed) = merge(&empty, &db);
        assert!(!changed);
        assert_eq!(merged, empty);
        assert!(create_delta(&empty, &db).is_empty());
        assert!(update_plan(&empty, &db).is_empty());
    }

    #[test]
    fn bootstrap_from_database() {
        let mut node = db_node(1, 1, "h1", 3080);
        node.weight = 0;
        let db = snapshot(vec![db_cluster(1, "A", Some("x"))], vec![node]);

        let (merged, changed) = merge(&ClusterConfig::default(), &db);

        assert!(changed);
        assert_eq!(
            merged.clusters,
            vec![cluster_doc("a", "x", vec![doc_node("h1", 3080, "http", 0, 3)])]
        );
        let (again, changed_again) = merge(&merged, &db);
        assert!(!changed_again);
        assert_eq!(again, merged);
        assert!(check(&merged, &db).in_sync());
    }

    #[test]
    fn merge_keeps_config_values_and_fills_gaps() {
        let config = cfg(vec![
            cluster_doc("lab", "", vec![doc_node("h1", 3080, "http", 9, 3)]),
            cluster_doc("new", "", vec![]),
        ]);
        let db = snapshot(
            vec![db_cluster(1, "Lab", Some("from db")), db_cluster(2, "other", None)],
            vec![db_node(1, 1, "h1", 3080), db_node(2, 1, "h2", 3080)],
        );

        let (merged, changed) = merge(&config, &db);

        assert!(changed);
        let names: Vec<_> = merged.clusters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["lab", "new", "other"]);
        let lab = &merged.clusters[0];
        assert_eq!(lab.description, "from db");
        assert_eq!(lab.nodes.len(), 2);
        assert_eq!(lab.nodes[0].weight, 9, "config value must win");
        assert_eq!(lab.nodes[1].host, "h2");
    }

    #[test]
    fn config_description_wins_when_both_present() {
        let config = cfg(vec![cluster_doc("lab", "mine", vec![])]);
        let db = snapshot(vec![db_cluster(1, "lab", Some("theirs"))], vec![]);
        let (merged, _) = merge(&config, &db);
        assert_eq!(merged.clusters[0].description, "mine");
    }

    #[test]
    fn merge_drops_duplicate_nodes() {
        let config = cfg(vec![cluster_doc(
            "lab",
            "",
            vec![
                doc_node("h1", 3080, "http", 5, 3),
                doc_node(" H1 ", 3080, "https", 1, 3),
            ],
        )]);
        let (merged, changed) = merge(&config, &Snapshot::default());
        assert!(changed);
        assert_eq!(merged.clusters[0].nodes, vec![doc_node("h1", 3080, "http", 5, 3)]);
    }

    #[test]
    fn merge_is_idempotent() {
        let config = cfg(vec![
            cluster_doc(" Zeta ", "  padded  ", vec![doc_node("b", 2, "", 1, 0)]),
            cluster_doc("alpha", "", vec![doc_node("a", 1, "HTTPS", 1, 7)]),
        ]);
        let db = snapshot(
            vec![db_cluster(1, "alpha", Some("db")), db_cluster(2, "beta", None)],
            vec![db_node(1, 2, "c", 3)],
        );
        let (once, _) = merge(&config, &db);
        let (twice, changed) = merge(&once, &db);
        assert_eq!(once, twice);
        assert!(!changed);
    }

    #[test]
    fn canonical_order_sorts_by_name_then_host_and_port() {
        let config = cfg(vec![
            cluster_doc("b", "", vec![]),
            cluster_doc(
                "A",
                "",
                vec![
                    doc_node("h1", 8080, "http", 5, 3),
                    doc_node("h0", 9000, "http", 5, 3),
                    doc_node("h1", 80, "http", 5, 3),
                ],
            ),
        ]);
        let canonical = config.canonical();
        assert_eq!(canonical.clusters[0].name, "a");
        let keys: Vec<_> = canonical.clusters[0]
            .nodes
            .iter()
            .map(|n| (n.host.as_str(), n.port))
            .collect();
        assert_eq!(keys, vec![("h0", 9000), ("h1", 80), ("h1", 8080)]);
        assert_eq!(canonical.canonical(), canonical);
    }

    #[test]
    fn check_reports_every_kind_of_mismatch() {
        let config = cfg(vec![
            cluster_doc(
                "lab",
                "cfg",
                vec![
                    doc_node("h1", 3080, "https", 7, 4),
                    doc_node("only-cfg", 1, "http", 5, 3),
                ],
            ),
            cluster_doc("cfg-only", "", vec![]),
        ]);
        let mut db_h1 = db_node(1, 1, "h1", 3080);
        db_h1.auth_user = "v".into();
        let db = snapshot(
            vec![db_cluster(1, "lab", Some("db")), db_cluster(2, "db-only", None)],
            vec![db_h1, db_node(2, 1, "only-db", 2)],
        );

        let report = check(&config, &db);

        assert!(!report.in_sync());
        let text: Vec<String> = report.mismatches.iter().map(ToString::to_string).collect();
        let has = |needle: &str| text.iter().any(|t| t.contains(needle));
        assert!(has("\"cfg-only\" exists in config but not in DB"), "{text:?}");
        assert!(has("\"db-only\" exists in DB but not in config"));
        assert!(has("description differs"));
        assert!(has("node only-cfg:1 exists in config but not in DB"));
        assert!(has("node only-db:2 exists in DB but not in config"));
        for field in ["protocol", "weight", "max_groups", "user"] {
            assert!(has(&format!("h1:3080 {field} differs")), "{field}: {text:?}");
        }
    }

    #[test]
    fn check_compares_case_insensitively_after_defaulting() {
        let config = cfg(vec![cluster_doc(
            "lab",
            " desc ",
            vec![NodeDoc {
                host: "H1".into(),
                port: 3080,
                user: " U ".into(),
                protocol: "".into(),
                weight: 5,
                max_groups: 0,
            }],
        )]);
        let mut node = db_node(1, 1, "h1", 3080);
        node.protocol = "HTTP".into();
        let db = snapshot(vec![db_cluster(1, "LAB", Some("desc"))], vec![node]);
        assert!(check(&config, &db).in_sync(), "{:?}", check(&config, &db));
    }

    #[test]
    fn empty_protocol_and_default_protocol_are_equivalent() {
        let implicit = cfg(vec![cluster_doc("lab", "", vec![doc_node("h1", 1, "", 5, 0)])]);
        let explicit = cfg(vec![cluster_doc("lab", "", vec![doc_node("h1", 1, "http", 5, 3)])]);
        let db = snapshot(vec![db_cluster(1, "lab", None)], vec![db_node(1, 1, "h1", 1)]);

        assert_eq!(check(&implicit, &db), check(&explicit, &db));
        assert_eq!(merge(&implicit, &db).0, merge(&explicit, &db).0);
        assert_eq!(create_delta(&implicit, &db), create_delta(&explicit, &db));
        assert!(update_plan(&implicit, &db).is_empty());
        assert!(update_plan(&explicit, &db).is_empty());
        assert_eq!(
            create_delta(&implicit, &Snapshot::default()),
            create_delta(&explicit, &Snapshot::default())
        );
    }

    #[test]
    fn in_sync_implies_unchanged_merge() {
        let config = cfg(vec![cluster_doc("lab", "x", vec![doc_node("h1", 1, "http", 5, 3)])]);
        let db = snapshot(vec![db_cluster(1, "lab", Some("x"))], vec![db_node(1, 1, "h1", 1)]);
        assert!(check(&config, &db).in_sync());
        assert!(!merge(&config, &db).1);

        let db_extra = snapshot(
            vec![db_cluster(1, "lab", Some("x"))],
            vec![db_node(1, 1, "h1", 1), db_node(2, 1, "h2", 1)],
        );
        assert!(!check(&config, &db_extra).in_sync());
        assert!(merge(&config, &db_extra).1);
    }

    #[test]
    fn delta_creates_only_what_is_missing() {
        let config = cfg(vec![
            cluster_doc(
                "Lab",
                "",
                vec![doc_node("h1", 3080, "http", 5, 3), doc_node("h2", 3080, "http", 5, 3)],
            ),
            cluster_doc("New", "fresh", vec![]),
        ]);
        let db = snapshot(vec![db_cluster(1, "lab", None)], vec![db_node(1, 1, "h1", 3080)]);

        let delta = create_delta(&config, &db);

        assert_eq!(delta.new_clusters(), 1);
        assert_eq!(delta.new_nodes(), 1);
        assert_eq!(delta.clusters[0].existing_id, Some(1));
        assert_eq!(delta.clusters[0].nodes[0].key, NodeKey::new("h2", 3080));
        assert_eq!(delta.clusters[1].existing_id, None);
        assert_eq!(delta.clusters[1].name, "New");
        assert_eq!(delta.clusters[1].description.as_deref(), Some("fresh"));
    }

    #[test]
    fn protocol_change_is_an_update_not_a_new_node() {
        let config = cfg(vec![cluster_doc("lab", "", vec![doc_node("h1", 3080, "https", 5, 3)])]);
        let db = snapshot(vec![db_cluster(1, "lab", None)], vec![db_node(1, 1, "h1", 3080)]);

        assert!(create_delta(&config, &db).is_empty());
        let plan = update_plan(&config, &db);
        assert_eq!(plan.len(), 1);
        match &plan[0] {
            Update::Node { fields, .. } => assert_eq!(fields.protocol, "https"),
            other => panic!("unexpected update {other:?}"),
        }
    }

    #[test]
    fn update_plan_skips_matching_rows_and_empty_descriptions() {
        let config = cfg(vec![cluster_doc(
            "lab",
            "",
            vec![doc_node("h1", 3080, "http", 5, 3), doc_node("h2", 3080, "http", 7, 3)],
        )]);
        let db = snapshot(
            vec![db_cluster(1, "lab", Some("kept"))],
            vec![db_node(1, 1, "h1", 3080), db_node(2, 1, "h2", 3080)],
        );
        let plan = update_plan(&config, &db);
        assert_eq!(plan.len(), 1);
        assert!(matches!(&plan[0], Update::Node { key, .. } if key.host == "h2"));
    }

    #[test]
    fn missing_cluster_id_is_an_error_not_a_silent_skip() {
        let pending = |name: &str, existing_id: Option<i64>| PendingCluster {
            existing_id,
            name: name.into(),
            description: None,
            nodes: vec![PendingNode {
                key: NodeKey::new("h1", 3080),
                node: NodeView {
                    protocol: "http".into(),
                    weight: 5,
                    max_groups: 3,
                    auth_user: String::new(),
                },
            }],
        };

        let inserts = node_inserts(vec![pending("a", Some(4)), pending("b", None)], [9]).unwrap();
        let ids: Vec<_> = inserts.iter().map(|n| n.cluster_id).collect();
        assert_eq!(ids, vec![4, 9]);

        let err = node_inserts(vec![pending("b", None), pending("c", None)], [9]).unwrap_err();
        assert!(err.to_string().contains("`c`"), "{err}");
    }

    #[test]
    fn executes_delta_then_updates_against_a_real_store() {
        let mut store = Store::open_in_memory().unwrap();
        let config = cfg(vec![cluster_doc(
            "lab",
            "teaching",
            vec![doc_node("h1", 3080, "http", 5, 3), doc_node("h2", 3080, "http", 5, 3)],
        )]);

        let delta = create_delta(&config, &store.snapshot().unwrap());
        let outcome = execute_delta(&mut store, delta).unwrap();
        assert_eq!(outcome, DeltaOutcome { clusters_created: 1, nodes_created: 2 });
        let snap = store.snapshot().unwrap();
        assert!(check(&config, &snap).in_sync());
        assert!(create_delta(&config, &snap).is_empty());
        assert!(update_plan(&config, &snap).is_empty());

        let mut edited = config.clone();
        edited.clusters[0].nodes[0].weight = 7;
        edited.clusters[0].nodes[0].user = "v".into();
        let plan = update_plan(&edited, &store.snapshot().unwrap());
        assert_eq!(execute_updates(&mut store, &plan).unwrap(), 1);
        let rows = store.list_nodes().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].weight, rows[0].auth_user.as_str()), (7, "v"));
        assert!(check(&edited, &store.snapshot().unwrap()).in_sync());
    }
}
