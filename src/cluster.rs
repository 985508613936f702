//! The `cluster` verbs, wired to the state directory.
//!
//! Each function opens what it needs, does its work and closes it again.
//! Interactive decisions are passed in as callbacks so the CLI can prompt and
//! tests can answer.

use crate::document::{ClusterConfig, ClusterDoc, normalize};
use crate::error::{ClusterError, Result};
use crate::nodes::{self, NodeDefaults};
use crate::probe::{ControllerUrl, Probe};
use crate::reconcile::{self, CheckReport, DeltaOutcome, Mismatch};
use crate::state::StateDir;
use crate::store::{ClusterRow, NewCluster, NodeRow, Store};
use std::env;
use std::fs;
use std::io::Write;
use std::process::Command;
use tracing::{debug, info};

/// Questions a verb may need answered before it writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt<'a> {
    /// No config file exists; generate it from the database?
    Bootstrap,
    /// Config and database disagree; bring them together?
    OutOfSync(&'a [Mismatch]),
    /// About to write the config's clusters and nodes to the database.
    Apply { nodes: usize },
}

fn load_config(state: &StateDir) -> Result<ClusterConfig> {
    ClusterConfig::load(&state.config_path())
}

fn load_or_empty(state: &StateDir) -> Result<ClusterConfig> {
    match load_config(state) {
        Err(ClusterError::NoConfig(_)) => Ok(ClusterConfig::default()),
        other => other,
    }
}

fn open_store(state: &StateDir) -> Result<Store> {
    Store::init_if_needed(&state.db_path())
}

/// Creates an empty cluster and appends it to the config file.
pub fn create_cluster(
    state: &StateDir,
    name: &str,
    description: Option<&str>,
) -> Result<ClusterRow> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ClusterError::validation("cluster name must not be empty"));
    }
    let description = description
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string);

    let mut cfg = load_or_empty(state)?;
    let mut store = open_store(state)?;
    if store.cluster_exists(name)? {
        return Err(ClusterError::ClusterExists {
            name: name.to_string(),
        });
    }
    let mut created = store.create_clusters(&[NewCluster {
        name: name.to_string(),
        description: description.clone(),
    }])?;
    let row = created
        .pop()
        .ok_or_else(|| ClusterError::validation("cluster insert returned no row"))?;

    if cfg.find(name).is_none() {
        cfg.clusters.push(ClusterDoc {
            name: normalize(name),
            description: description.unwrap_or_default(),
            nodes: Vec::new(),
        });
    }
    cfg.save(&state.config_path())?;
    info!(cluster = %row.name, id = row.id, "created cluster");
    Ok(row)
}

pub fn list_clusters(state: &StateDir) -> Result<Vec<ClusterRow>> {
    open_store(state)?.list_clusters()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// The config file was missing and has been generated from the database.
    pub bootstrapped: bool,
    /// A prompt was answered with no; nothing was written.
    pub declined: bool,
    pub config_written: bool,
    pub created: DeltaOutcome,
    /// Differences left after syncing. Only field edits remain; `apply` pushes them.
    pub pending: Vec<Mismatch>,
}

impl SyncReport {
    pub fn nothing_to_do(&self) -> bool {
        !self.bootstrapped
            && !self.declined
            && !self.config_written
            && self.created == DeltaOutcome::default()
    }
}

/// Brings the config and the database together without probing.
///
/// The database is folded into the config (config values win), the config is
/// rewritten if that changed it, and clusters or nodes only the config knows
/// are inserted. Field edits are left for `apply`.
pub fn sync(state: &StateDir, confirm: &mut dyn FnMut(Prompt<'_>) -> bool) -> Result<SyncReport> {
    let mut store = open_store(state)?;
    let snapshot = store.snapshot()?;
    let mut report = SyncReport::default();

    let cfg = match load_config(state) {
        Ok(cfg) => cfg,
        Err(ClusterError::NoConfig(_)) => {
            if !confirm(Prompt::Bootstrap) {
                report.declined = true;
                return Ok(report);
            }
            let (generated, _) = reconcile::merge(&ClusterConfig::default(), &snapshot);
            generated.save(&state.config_path())?;
            info!(clusters = generated.clusters.len(), "generated cluster config from database");
            report.bootstrapped = true;
            report.config_written = true;
            return Ok(report);
        }
        Err(err) => return Err(err),
    };

    let (merged, changed) = reconcile::merge(&cfg, &snapshot);
    let before = reconcile::check(&merged, &snapshot);
    let delta = reconcile::create_delta(&merged, &snapshot);
    if !changed && delta.is_empty() {
        report.pending = before.mismatches;
        return Ok(report);
    }
    if !confirm(Prompt::OutOfSync(&before.mismatches)) {
        report.declined = true;
        report.pending = before.mismatches;
        return Ok(report);
    }

    if changed {
        merged.save(&state.config_path())?;
        report.config_written = true;
    }
    debug!(
        clusters = delta.new_clusters(),
        nodes = delta.new_nodes(),
        "inserting rows missing from the database"
    );
    report.created = reconcile::execute_delta(&mut store, delta)?;
    report.pending = reconcile::check(&merged, &store.snapshot()?).mismatches;
    debug!(
        config_written = report.config_written,
        pending = report.pending.len(),
        "sync finished"
    );
    Ok(report)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub declined: bool,
    pub created: DeltaOutcome,
    pub updates: usize,
}

/// Writes the config into the database after every controller it names has
/// answered a probe. The config file itself is never written.
pub fn apply(
    state: &StateDir,
    prober: &dyn Probe,
    confirm: &mut dyn FnMut(Prompt<'_>) -> bool,
) -> Result<ApplyReport> {
    let cfg = load_config(state)?;
    let view = reconcile::doc_view(&cfg);
    let urls: Vec<ControllerUrl> = view
        .values()
        .flat_map(|cluster| {
            cluster.nodes.iter().map(|(key, node)| ControllerUrl {
                protocol: node.protocol.clone(),
                host: key.host.clone(),
                port: key.port,
            })
        })
        .collect();

    if !confirm(Prompt::Apply { nodes: urls.len() }) {
        return Ok(ApplyReport {
            declined: true,
            ..ApplyReport::default()
        });
    }
    for url in &urls {
        prober.probe(url)?;
    }

    let mut store = open_store(state)?;
    let delta = reconcile::create_delta(&cfg, &store.snapshot()?);
    let created = reconcile::execute_delta(&mut store, delta)?;
    let plan = reconcile::update_plan(&cfg, &store.snapshot()?);
    let updates = reconcile::execute_updates(&mut store, &plan)?;
    info!(
        clusters = created.clusters_created,
        nodes = created.nodes_created,
        updates,
        "applied cluster config"
    );
    Ok(ApplyReport {
        declined: false,
        created,
        updates,
    })
}

pub fn check(state: &StateDir) -> Result<CheckReport> {
    let cfg = load_config(state)?;
    let store = open_store(state)?;
    Ok(reconcile::check(&cfg, &store.snapshot()?))
}

/// The config file as it would be written: canonical and defaulted.
pub fn show(state: &StateDir) -> Result<String> {
    load_config(state)?.canonical().to_toml()
}

/// Runs `edit_fn` on the serialized config and saves the result.
///
/// The edited text must parse and validate; otherwise the file on disk is
/// left exactly as it was.
pub fn edit(state: &StateDir, edit_fn: impl FnOnce(&str) -> Result<String>) -> Result<ClusterConfig> {
    let path = state.config_path();
    let cfg = load_config(state)?;
    let edited = edit_fn(&cfg.to_toml()?)?;
    let parsed = ClusterConfig::parse(&edited, &path)?;
    parsed.save(&path)?;
    Ok(parsed.canonical())
}

/// Opens `text` in `$VISUAL`, `$EDITOR` or `vi` and returns what was saved.
pub fn launch_editor(text: &str) -> Result<String> {
    let editor = ["VISUAL", "EDITOR"]
        .iter()
        .filter_map(|var| env::var(var).ok())
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "vi".to_string());

    let mut file = tempfile::Builder::new()
        .prefix("cluster_config.")
        .suffix(".toml")
        .tempfile()
        .map_err(|e| ClusterError::io(&env::temp_dir(), e))?;
    file.write_all(text.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| ClusterError::io(file.path(), e))?;

    let mut words = editor.split_whitespace();
    let program = words.next().unwrap_or("vi");
    debug!(editor = %editor, path = %file.path().display(), "launching editor");
    let status = Command::new(program)
        .args(words)
        .arg(file.path())
        .status()
        .map_err(|e| ClusterError::io(std::path::Path::new(program), e))?;
    if !status.success() {
        return Err(ClusterError::validation(format!(
            "editor `{editor}` exited with {status}; config left unchanged"
        )));
    }
    fs::read_to_string(file.path()).map_err(|e| ClusterError::io(file.path(), e))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddNodesReport {
    pub added: Vec<NodeRow>,
    pub sync: SyncReport,
}

/// Probes the given controllers, adds them to `cluster` and syncs the config.
pub fn add_nodes<P: Probe + Sync>(
    state: &StateDir,
    prober: &P,
    cluster: &str,
    urls: &[String],
    defaults: &NodeDefaults,
) -> Result<AddNodesReport> {
    if !open_store(state)?.cluster_exists(cluster)? {
        return Err(ClusterError::ClusterNotFound {
            name: cluster.trim().to_string(),
        });
    }
    let records = nodes::acquire_nodes(prober, urls, defaults)?;
    let added = nodes::insert_into_cluster(&mut open_store(state)?, cluster, &records)?;
    let sync = sync(state, &mut |_| true)?;
    Ok(AddNodesReport { added, sync })
}
