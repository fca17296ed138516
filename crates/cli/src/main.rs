use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use flotilla_api::{BundleDeploymentStorage, Event, ListOptions, StandardStorage, StorageConfig, UpdateFn};
use flotilla_core::{
    BundleDeployment, BundleDeploymentList, BundleDeploymentStatus, BundleSummary, LabelSelector, Registry,
    RequestContext,
};
use flotilla_diff::{detect_drift, diff_normalizer, modified_status, parse_manifest, Drift, Normalizer, RuleSet};
use flotilla_status::{set_resources, StatusBase};
use kube::ResourceExt;
use metrics::counter;
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "flotillactl", version, about = "Flotilla BundleDeployment storage and status tools")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for namespaced operations (all namespaces for list/watch when unset)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// SQLite database path
    #[arg(long = "db", global = true, env = "FLOTILLA_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a BundleDeployment from a YAML file ("-" for stdin)
    Create {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Print one BundleDeployment
    Get { name: String },
    /// List BundleDeployments
    List {
        /// Label selector, e.g. "env=prod,tier=web"
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
    /// Replace a BundleDeployment with the contents of a YAML file
    Update {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Create the object when it does not exist
        #[arg(long = "force-create", action = ArgAction::SetTrue)]
        force_create: bool,
    },
    /// Replace the status of a BundleDeployment with a YAML status document
    UpdateStatus {
        name: String,
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Delete a BundleDeployment
    Delete { name: String },
    /// Stream Added/Modified/Deleted events until Ctrl-C
    Watch {
        /// Start after this resource version; 0 replays current objects first
        #[arg(long = "rv", default_value_t = 0)]
        resource_version: i64,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
    /// Merge deployment status reports into per-resource summaries
    Summarize {
        /// YAML list of BundleDeployments; read from the store when omitted
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        /// Parent deployments still waiting to apply
        #[arg(long = "wait-applied", default_value_t = 0)]
        wait_applied: u32,
        /// Parent deployments that failed to apply
        #[arg(long = "err-applied", default_value_t = 0)]
        err_applied: u32,
    },
    /// Print an object after the normalizer chain has run
    Normalize {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Ignore rules and overrides (YAML)
        #[arg(long = "rules")]
        rules: Option<PathBuf>,
    },
    /// Compare a desired manifest with the live object
    Drift {
        #[arg(long = "desired")]
        desired: Option<PathBuf>,
        #[arg(long = "live")]
        live: Option<PathBuf>,
        #[arg(long = "rules")]
        rules: Option<PathBuf>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Create { .. } => "create",
            Commands::Get { .. } => "get",
            Commands::List { .. } => "list",
            Commands::Update { .. } => "update",
            Commands::UpdateStatus { .. } => "update-status",
            Commands::Delete { .. } => "delete",
            Commands::Watch { .. } => "watch",
            Commands::Summarize { .. } => "summarize",
            Commands::Normalize { .. } => "normalize",
            Commands::Drift { .. } => "drift",
        }
    }
}

fn init_tracing() {
    let env = std::env::var("FLOTILLA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FLOTILLA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid FLOTILLA_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        return std::io::read_to_string(std::io::stdin()).context("reading stdin");
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = read_input(path)?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// A YAML sequence of deployments or a BundleDeploymentList.
fn read_deployments(path: &Path) -> Result<Vec<BundleDeployment>> {
    let raw = read_input(path)?;
    if let Ok(items) = serde_yaml::from_str::<Vec<BundleDeployment>>(&raw) {
        return Ok(items);
    }
    let list: BundleDeploymentList = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(list.items)
}

fn read_rules(path: Option<&Path>) -> Result<RuleSet> {
    match path {
        Some(p) => Ok(RuleSet::from_yaml(&read_input(p)?)?),
        None => Ok(RuleSet::default()),
    }
}

fn load_manifest(path: Option<&Path>) -> Result<Option<serde_json::Value>> {
    match path {
        Some(p) => Ok(Some(parse_manifest(&read_input(p)?)?)),
        None => Ok(None),
    }
}

fn selector(raw: Option<&str>) -> Result<LabelSelector> {
    match raw {
        Some(s) => LabelSelector::parse(s).map_err(|e| anyhow!("invalid selector {s:?}: {e}")),
        None => Ok(LabelSelector::everything()),
    }
}

fn print<T: Serialize>(output: Output, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Output::Human => human(value),
    }
    Ok(())
}

fn line(bd: &BundleDeployment) -> String {
    let status = bd.status.as_ref();
    format!(
        "{}/{} • rv={} • gen={} • deployment={} • ready={}",
        bd.namespace().unwrap_or_default(),
        bd.name_any(),
        bd.resource_version().unwrap_or_default(),
        bd.metadata.generation.unwrap_or_default(),
        bd.spec.deployment_id,
        status.map(|s| s.ready).unwrap_or(false),
    )
}

fn print_object(output: Output, bd: &BundleDeployment) -> Result<()> {
    print(output, bd, |bd| println!("{}", line(bd)))
}

fn open_storage(cli: &Cli) -> Result<BundleDeploymentStorage> {
    let mut cfg = StorageConfig::from_env();
    if let Some(db) = &cli.db {
        cfg.db_path = db.clone();
    }
    info!(db = %cfg.db_path, "opening store");
    Ok(BundleDeploymentStorage::open(&cfg, &Registry::fleet())?)
}

fn context(cli: &Cli) -> RequestContext {
    match &cli.namespace {
        Some(ns) => RequestContext::namespaced(ns.clone()),
        None => RequestContext::new(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    counter!("cli_commands_total", 1u64, "command" => cli.command.name());

    match &cli.command {
        Commands::Create { file } => {
            let storage = open_storage(&cli)?;
            let obj: BundleDeployment = read_yaml(file)?;
            let created = storage.create(&context(&cli), obj).await?;
            print_object(cli.output, &created)?;
            storage.destroy();
        }
        Commands::Get { name } => {
            let storage = open_storage(&cli)?;
            let obj = storage.get(&context(&cli), name).await?;
            print_object(cli.output, &obj)?;
            storage.destroy();
        }
        Commands::List { selector: sel } => {
            let storage = open_storage(&cli)?;
            let list = storage.list(&context(&cli), &ListOptions::selector(selector(sel.as_deref())?)).await?;
            print(cli.output, &list, |list| {
                for bd in &list.items {
                    println!("{}", line(bd));
                }
                println!("({} items at rv {})", list.items.len(), list.resource_version().unwrap_or_default());
            })?;
            storage.destroy();
        }
        Commands::Update { file, force_create } => {
            let storage = open_storage(&cli)?;
            let obj: BundleDeployment = read_yaml(file)?;
            let name = obj.metadata.name.clone().ok_or_else(|| anyhow!("metadata.name is required"))?;
            let replace: UpdateFn = Box::new(move |_| Ok(obj));
            let (updated, created) = storage.update(&context(&cli), &name, replace, *force_create).await?;
            if created {
                info!(name = %name, "object did not exist; created");
            }
            print_object(cli.output, &updated)?;
            storage.destroy();
        }
        Commands::UpdateStatus { name, file } => {
            let storage = open_storage(&cli)?;
            let status: BundleDeploymentStatus = read_yaml(file)?;
            let set_status: UpdateFn = Box::new(move |current| {
                let mut obj = current.unwrap_or_default();
                obj.status = Some(status);
                Ok(obj)
            });
            let (updated, _) = storage.status().update(&context(&cli), name, set_status).await?;
            print_object(cli.output, &updated)?;
            storage.destroy();
        }
        Commands::Delete { name } => {
            let storage = open_storage(&cli)?;
            let deleted = storage.delete(&context(&cli), name).await?;
            print_object(cli.output, &deleted)?;
            storage.destroy();
        }
        Commands::Watch { resource_version, selector: sel } => {
            let storage = open_storage(&cli)?;
            let opts = ListOptions { label_selector: selector(sel.as_deref())?, resource_version: Some(*resource_version) };
            let ctx = context(&cli);
            let mut stream = storage.watch(&ctx, &opts).await?;
            loop {
                tokio::select! {
                    maybe = stream.recv() => {
                        let Some(ev) = maybe else {
                            warn!("watch stream closed");
                            break;
                        };
                        let (mark, obj) = match &ev {
                            Event::Added(o) => ("+", o),
                            Event::Modified(o) => ("~", o),
                            Event::Deleted(o) => ("-", o),
                            _ => continue,
                        };
                        match cli.output {
                            Output::Json => println!("{}", serde_json::to_string(&ev)?),
                            Output::Human => println!("{mark} {}", line(obj)),
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            ctx.cancel.cancel();
            storage.destroy();
        }
        Commands::Summarize { file, selector: sel, wait_applied, err_applied } => {
            let deployments = match file {
                Some(path) => read_deployments(path)?,
                None => {
                    let storage = open_storage(&cli)?;
                    let list = storage.list(&context(&cli), &ListOptions::selector(selector(sel.as_deref())?)).await?;
                    storage.destroy();
                    list.items
                }
            };
            let mut status = StatusBase {
                summary: BundleSummary { wait_applied: *wait_applied, err_applied: *err_applied, ..Default::default() },
                ..Default::default()
            };
            set_resources(&deployments, &mut status);
            print(cli.output, &status, |status| {
                for r in &status.resources {
                    let flag = if r.incomplete_state { " (incomplete)" } else { "" };
                    println!("{}/{} • {}{}", r.type_, r.id, r.state, flag);
                    for pc in &r.per_cluster_state {
                        println!("    {} • {}", pc.cluster_id, pc.state);
                    }
                }
                let c = &status.resource_counts;
                println!(
                    "ready {}/{} • waitApplied {} • modified {} • orphaned {} • missing {} • unknown {} • notReady {}",
                    c.ready, c.desired_ready, c.wait_applied, c.modified, c.orphaned, c.missing, c.unknown, c.not_ready
                );
                for e in &status.resource_errors {
                    eprintln!("error: {e}");
                }
            })?;
        }
        Commands::Normalize { file, rules } => {
            let mut obj = parse_manifest(&read_input(file)?)?;
            let normalizer = diff_normalizer(Vec::new(), &read_rules(rules.as_deref())?)?;
            normalizer.normalize(&mut obj)?;
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&obj)?),
                Output::Human => print!("{}", serde_yaml::to_string(&obj)?),
            }
        }
        Commands::Drift { desired, live, rules } => {
            if desired.is_none() && live.is_none() {
                bail!("at least one of --desired and --live is required");
            }
            let (desired, live) = (load_manifest(desired.as_deref())?, load_manifest(live.as_deref())?);
            let normalizer = diff_normalizer(Vec::new(), &read_rules(rules.as_deref())?)?;
            let drift = detect_drift(desired.as_ref(), live.as_ref(), &normalizer)?;
            let subject = desired.as_ref().or(live.as_ref()).ok_or_else(|| anyhow!("no object"))?;
            let status = modified_status(subject, &drift);
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&serde_json::json!({"drift": drift, "modifiedStatus": status}))?),
                Output::Human => match &drift {
                    Drift::InSync => println!("in sync"),
                    Drift::Missing => println!("missing: desired object is not on the cluster"),
                    Drift::Orphaned => println!("orphaned: live object is no longer desired"),
                    Drift::Modified { patch, summary } => {
                        println!("modified: +{} ~{} -{}", summary.adds, summary.updates, summary.removes);
                        println!("{}", serde_json::to_string_pretty(patch)?);
                    }
                },
            }
        }
    }
    Ok(())
}
