mod client;
mod cluster;
mod document;
mod error;
mod keyring;
mod nodes;
mod probe;
mod reconcile;
mod state;
mod store;

use crate::cluster::Prompt;
use crate::keyring::Keyring;
use crate::nodes::NodeDefaults;
use crate::probe::ControllerProbe;
use crate::reconcile::Mismatch;
use crate::state::StateDir;
use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "gns3ctl",
    version,
    about = "Manage clusters of GNS3 controllers"
)]
struct Cli {
    #[arg(
        long,
        short = 'i',
        global = true,
        help = "Skip TLS certificate verification when talking to controllers"
    )]
    insecure: bool,

    #[arg(
        long,
        short = 'k',
        value_name = "PATH",
        global = true,
        help = "Keyring file to use (a directory means <dir>/gns3key)"
    )]
    key_file: Option<PathBuf>,

    #[arg(long, global = true, help = "Disable colored output")]
    no_color: bool,

    #[arg(
        long,
        short = 'o',
        value_enum,
        default_value_t = OutputFormat::Pretty,
        global = true,
        help = "Output format"
    )]
    output: OutputFormat,

    #[arg(long, global = true, help = "Log debug output to stderr")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cluster management
    #[command(subcommand)]
    Cluster(ClusterCommand),
    /// Generate shell completion scripts
    Completion {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand)]
enum ClusterCommand {
    /// Create an empty cluster
    Create {
        #[arg(long, short = 'n', help = "Name for the cluster")]
        name: String,
        #[arg(long, short = 'd', help = "Description for the cluster")]
        description: Option<String>,
    },
    /// List clusters in the database
    Ls,
    /// Add one controller to a cluster
    AddNode {
        /// Cluster to add the controller to
        cluster: String,
        #[arg(
            long,
            short = 's',
            value_name = "URL",
            help = "Controller as scheme://host:port (omit to pick from the keyring)"
        )]
        server: Option<String>,
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Add two or more controllers to a cluster
    AddNodes {
        /// Cluster to add the controllers to
        cluster: String,
        #[arg(
            long = "server",
            short = 's',
            value_name = "URL",
            help = "Controller as scheme://host:port, repeatable (omit to pick from the keyring)"
        )]
        servers: Vec<String>,
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Cluster config file operations
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Sync the cluster config file with the database
    Sync {
        #[arg(long, help = "Run without asking for confirmation")]
        no_confirm: bool,
        #[arg(long, short = 'v', help = "Show every mismatch")]
        verbose: bool,
    },
    /// Probe every controller in the config and write the config to the database
    Apply {
        #[arg(long, help = "Run without asking for confirmation")]
        no_confirm: bool,
        #[command(flatten)]
        credentials: Credentials,
    },
    /// Compare the config file with the database
    Check {
        #[arg(long, short = 'v', help = "Show every mismatch")]
        verbose: bool,
    },
    /// Open the config file in $VISUAL or $EDITOR
    Edit,
    /// Print the config file in canonical form
    Show,
}

#[derive(Args, Clone)]
struct Credentials {
    #[arg(
        long,
        short = 'u',
        env = "GNS3_USER",
        help = "User to log in with when no token is stored"
    )]
    user: Option<String>,
    #[arg(
        long,
        short = 'p',
        env = "GNS3_PASSWORD",
        hide_env_values = true,
        help = "Password to log in with when no token is stored"
    )]
    password: Option<String>,
}

#[derive(Args, Clone)]
struct NodeArgs {
    #[command(flatten)]
    credentials: Credentials,
    #[arg(
        long,
        short = 'w',
        default_value_t = nodes::DEFAULT_WEIGHT,
        value_parser = clap::value_parser!(u8).range(0..=10),
        help = "Weight to assign to the node(s), 0-10"
    )]
    weight: u8,
    #[arg(
        long,
        short = 'g',
        default_value_t = document::DEFAULT_MAX_GROUPS,
        help = "Maximum number of groups per node"
    )]
    max_groups: u32,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum OutputFormat {
    Pretty,
    Json,
}

/// Settings shared by every verb, fixed once the command line is parsed.
struct GlobalOptions {
    verify_tls: bool,
    key_file: Option<PathBuf>,
    output: OutputFormat,
}

impl GlobalOptions {
    fn keyring(&self, state: &StateDir) -> Result<Keyring> {
        let path = Keyring::location(state.keyring_path(), self.key_file.as_deref());
        Keyring::open(&path).with_context(|| format!("loading keyring {}", path.display()))
    }
}

fn init_logging(debug: bool, no_color: bool) {
    let fallback = if debug { "gns3ctl=debug" } else { "gns3ctl=warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!no_color),
        )
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.no_color {
        colored::control::set_override(false);
    }
    init_logging(cli.debug, cli.no_color);

    let opts = GlobalOptions {
        verify_tls: !cli.insecure,
        key_file: cli.key_file.clone(),
        output: cli.output,
    };

    match cli.command {
        Commands::Cluster(command) => {
            let state = StateDir::locate().context("locating the gns3ctl state directory")?;
            debug!(root = %state.root().display(), "using state directory");
            handle_cluster(command, &state, &opts)?;
        }
        Commands::Completion { shell } => {
            use clap_complete::{generate, shells};
            let mut cmd = Cli::command();
            let bin = cmd.get_name().to_string();
            match shell {
                CompletionShell::Bash => {
                    generate(shells::Bash, &mut cmd, bin, &mut std::io::stdout())
                }
                CompletionShell::Zsh => {
                    generate(shells::Zsh, &mut cmd, bin, &mut std::io::stdout())
                }
                CompletionShell::Fish => {
                    generate(shells::Fish, &mut cmd, bin, &mut std::io::stdout())
                }
                CompletionShell::PowerShell => {
                    generate(shells::PowerShell, &mut cmd, bin, &mut std::io::stdout())
                }
            }
        }
    }

    Ok(())
}

fn handle_cluster(command: ClusterCommand, state: &StateDir, opts: &GlobalOptions) -> Result<()> {
    match command {
        ClusterCommand::Create { name, description } => {
            let row = cluster::create_cluster(state, &name, description.as_deref())?;
            success(&format!("created new empty cluster {}", row.name.bold()));
        }
        ClusterCommand::Ls => {
            let rows = cluster::list_clusters(state).context("listing clusters")?;
            match opts.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
                OutputFormat::Pretty if rows.is_empty() => println!("No clusters found."),
                OutputFormat::Pretty => {
                    let table: Vec<Vec<String>> = rows
                        .into_iter()
                        .map(|r| vec![r.id.to_string(), r.name, r.description.unwrap_or_default()])
                        .collect();
                    print_table(&["ID", "Name", "Description"], &table);
                }
            }
        }
        ClusterCommand::AddNode {
            cluster,
            server,
            node,
        } => {
            let servers: Vec<String> = server.into_iter().collect();
            add_nodes(state, opts, &cluster, servers, node, Arity::One)?;
        }
        ClusterCommand::AddNodes {
            cluster,
            servers,
            node,
        } => {
            add_nodes(state, opts, &cluster, servers, node, Arity::Many)?;
        }
        ClusterCommand::Config(command) => handle_config(command, state, opts)?,
    }
    Ok(())
}

fn handle_config(command: ConfigCommand, state: &StateDir, opts: &GlobalOptions) -> Result<()> {
    match command {
        ConfigCommand::Sync {
            no_confirm,
            verbose,
        } => {
            let report = cluster::sync(state, &mut |prompt| {
                if verbose {
                    if let Prompt::OutOfSync(mismatches) = &prompt {
                        print_mismatches(mismatches);
                    }
                }
                no_confirm || confirm(&prompt_text(&prompt))
            })
            .context("syncing cluster config")?;

            if report.declined {
                println!("Aborted.");
            } else if report.bootstrapped {
                success("generated cluster config from the database.");
            } else if report.nothing_to_do() {
                println!("Nothing to do, config already synced.");
            } else {
                success(&format!(
                    "synced config with the database ({} cluster(s), {} node(s) created).",
                    report.created.clusters_created, report.created.nodes_created
                ));
            }
            if !report.declined && !report.pending.is_empty() {
                if verbose {
                    print_mismatches(&report.pending);
                }
                warning(&format!(
                    "{} field difference(s) remain; run `gns3ctl cluster config apply` to write them to the database.",
                    report.pending.len()
                ));
            }
        }
        ConfigCommand::Apply {
            no_confirm,
            credentials,
        } => {
            let prober = ControllerProbe::new(opts.keyring(state)?, opts.verify_tls)
                .with_credentials(credentials.user, credentials.password);
            let report = cluster::apply(state, &prober, &mut |prompt| {
                no_confirm || confirm(&prompt_text(&prompt))
            })
            .context("applying cluster config")?;
            if report.declined {
                println!("Aborted.");
            } else {
                success(&format!(
                    "applied config: {} cluster(s) and {} node(s) created, {} update(s).",
                    report.created.clusters_created, report.created.nodes_created, report.updates
                ));
            }
        }
        ConfigCommand::Check { verbose } => {
            let report = cluster::check(state).context("checking cluster config")?;
            if verbose {
                print_mismatches(&report.mismatches);
            }
            if !report.in_sync() {
                bail!(
                    "config is out of sync with the database ({} difference(s))",
                    report.mismatches.len()
                );
            }
            success("config is in sync with the database.");
        }
        ConfigCommand::Edit => {
            let saved = cluster::edit(state, cluster::launch_editor).context("editing cluster config")?;
            success(&format!(
                "saved cluster config with {} cluster(s).",
                saved.clusters.len()
            ));
        }
        ConfigCommand::Show => {
            print!("{}", cluster::show(state)?);
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Arity {
    One,
    Many,
}

fn add_nodes(
    state: &StateDir,
    opts: &GlobalOptions,
    cluster_name: &str,
    mut servers: Vec<String>,
    node: NodeArgs,
    arity: Arity,
) -> Result<()> {
    let keyring = opts.keyring(state)?;
    if servers.is_empty() {
        servers = select_servers(&keyring)?;
        if servers.is_empty() {
            warning("no controllers selected, nothing to add.");
            return Ok(());
        }
    }
    match arity {
        Arity::One if servers.len() > 1 => {
            bail!("add-node takes exactly one controller; use add-nodes for more")
        }
        Arity::Many if servers.len() < 2 => {
            bail!("add-nodes needs at least two controllers; use add-node for one")
        }
        _ => {}
    }

    let defaults = NodeDefaults {
        weight: node.weight,
        max_groups: node.max_groups,
        auth_user: node.credentials.user.clone().unwrap_or_default(),
    };
    let prober = ControllerProbe::new(keyring, opts.verify_tls)
        .with_credentials(node.credentials.user, node.credentials.password);
    let report = cluster::add_nodes(state, &prober, cluster_name, &servers, &defaults)
        .with_context(|| format!("adding nodes to cluster `{cluster_name}`"))?;

    success(&format!(
        "added {} node(s) to cluster {}.",
        report.added.len(),
        cluster_name.trim().bold()
    ));
    if report.sync.config_written {
        debug!("cluster config updated with the new nodes");
    }
    Ok(())
}

fn select_servers(keyring: &Keyring) -> Result<Vec<String>> {
    let entries = keyring.entries();
    if entries.is_empty() {
        bail!(
            "no saved controllers in {}; pass --server URL",
            keyring.path().display()
        );
    }
    let items: Vec<String> = entries
        .iter()
        .map(|e| format!("{} ({})", e.server_url, e.user))
        .collect();
    let picked = dialoguer::MultiSelect::new()
        .with_prompt("Select controllers to add (space to toggle, enter to confirm)")
        .items(&items)
        .interact()
        .context("reading controller selection")?;
    Ok(picked
        .into_iter()
        .map(|idx| entries[idx].server_url.clone())
        .collect())
}

fn prompt_text(prompt: &Prompt<'_>) -> String {
    match prompt {
        Prompt::Bootstrap => {
            format!("{} no cluster config found. Generate one from the database now?", "Warning:".yellow())
        }
        Prompt::OutOfSync(mismatches) => format!(
            "{} config and database differ ({} difference(s)). Sync them now?",
            "Warning:".yellow(),
            mismatches.len()
        ),
        Prompt::Apply { nodes } => format!(
            "Probe {nodes} controller(s) and write the cluster config to the database?"
        ),
    }
}

fn confirm(prompt: &str) -> bool {
    match dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
    {
        Ok(answer) => answer,
        Err(err) => {
            debug!(error = %err, "no answer to confirmation, assuming no");
            false
        }
    }
}

fn success(message: &str) {
    println!("{} {message}", "Success:".green().bold());
}

fn warning(message: &str) {
    eprintln!("{} {message}", "Warning:".yellow().bold());
}

fn print_mismatches(mismatches: &[Mismatch]) {
    for mismatch in mismatches {
        println!("{} {mismatch}", "Mismatch:".red());
    }
}

fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(cell.chars().count());
        }
    }

    for (i, col) in headers.iter().enumerate() {
        if i > 0 {
            print!("  ");
        }
        print!("{:width$}", col, width = widths[i]);
    }
    println!();
    for (i, width) in widths.iter().enumerate() {
        if i > 0 {
            print!("  ");
        }
        print!("{:-<width$}", "", width = *width);
    }
    println!();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i > 0 {
                print!("  ");
            }
            print!("{:width$}", cell, width = widths[i]);
        }
        println!();
    }
}
