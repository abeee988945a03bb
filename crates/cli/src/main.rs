use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kube::core::DynamicObject;
use tether_core::{KindFilter, KindRegistry, Owner, ResourceKind};
use tether_kubehub::{KubeStore, ObjectStore};
use tether_reconcile::{ReconcileConfig, ReconcileError, ReconcileReport, Reconciler};
use tokio::signal;
use tracing::{info, warn};

mod desired;

#[derive(Parser, Debug)]
#[command(name = "tetherctl", version, about = "Reconcile objects owned by a parent resource")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace of the owner
    #[arg(long = "ns", global = true, default_value = "default", env = "TETHER_NAMESPACE")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug, Clone)]
struct OwnerArgs {
    /// Owner name
    #[arg(long = "owner")]
    name: String,
    /// Owner kind key, e.g. "example.dev/v1/Stack"
    #[arg(long = "owner-kind", env = "TETHER_OWNER_KIND")]
    kind: String,
    /// Owner resource plural (default: lowercased kind + "s")
    #[arg(long = "owner-plural")]
    plural: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
struct FilterArgs {
    /// Only these kinds ("Kind" or "group/Kind", comma separated)
    #[arg(long = "only", value_delimiter = ',', conflicts_with = "exclude")]
    only: Vec<String>,
    /// Every kind except these
    #[arg(long = "exclude", value_delimiter = ',')]
    exclude: Vec<String>,
}

impl FilterArgs {
    fn filter(&self) -> KindFilter {
        if !self.only.is_empty() {
            KindFilter::only(self.only.clone())
        } else if !self.exclude.is_empty() {
            KindFilter::exclude(self.exclude.clone())
        } else {
            KindFilter::All
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the kinds the engine can reconcile
    Kinds,
    /// List objects that reference the owner
    Owned {
        #[command(flatten)]
        owner: OwnerArgs,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Apply desired objects for the owner and prune the rest
    Reconcile {
        #[command(flatten)]
        owner: OwnerArgs,
        #[command(flatten)]
        filter: FilterArgs,
        /// Multi-document YAML with the desired objects
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Run up to N passes until nothing is left to recreate
        #[arg(long = "converge", default_value_t = 1)]
        passes: u32,
        /// Pause between passes
        #[arg(long = "interval-ms", default_value_t = 2000)]
        interval_ms: u64,
    },
    /// Roll up owned workloads into the owner's status
    Status {
        #[command(flatten)]
        owner: OwnerArgs,
        /// Version reported when no component carries one
        #[arg(long = "declared-version")]
        declared_version: Option<String>,
    },
    /// Delete every object the owner owns
    Cleanup {
        #[command(flatten)]
        owner: OwnerArgs,
        #[command(flatten)]
        filter: FilterArgs,
    },
}

fn init_tracing() {
    let env = std::env::var("TETHER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TETHER_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_kind(key: &str, plural: Option<&str>) -> Option<ResourceKind> {
    let parts: Vec<&str> = key.split('/').collect();
    let (group, version, kind) = match parts.as_slice() {
        [version, kind] => ("", *version, *kind),
        [group, version, kind] => (*group, *version, *kind),
        _ => return None,
    };
    if version.is_empty() || kind.is_empty() {
        return None;
    }
    let plural = plural.map(str::to_string).unwrap_or_else(|| format!("{}s", kind.to_lowercase()));
    Some(ResourceKind::new(group, version, kind, &plural))
}

async fn resolve_owner(store: &dyn ObjectStore, ns: &str, args: &OwnerArgs) -> Result<Owner> {
    let kind = parse_kind(&args.kind, args.plural.as_deref())
        .ok_or_else(|| anyhow!("invalid owner kind {:?}; expected group/version/Kind or version/Kind", args.kind))?;
    let key = tether_core::ObjKey::new(kind.clone(), Some(ns), &args.name);
    let obj = store.get(&key).await.with_context(|| format!("fetching owner {}", key))?;
    Owner::from_object(kind, &obj).ok_or_else(|| anyhow!("owner {} has no uid", key))
}

/// Run `converge`, giving up when Ctrl-C arrives first.
async fn converge_until_interrupted(
    reconciler: &Reconciler,
    owner: &Owner,
    filter: &FilterArgs,
    desired: &[DynamicObject],
    passes: u32,
    interval: Duration,
) -> Result<Result<ReconcileReport, ReconcileError>> {
    let filter = filter.filter();
    let run = reconciler.converge(owner, &filter, desired, passes, interval);
    tokio::select! {
        r = run => Ok(r),
        _ = signal::ctrl_c() => Err(anyhow!("interrupted")),
    }
}

fn print_report(output: Output, report: &ReconcileReport) -> Result<()> {
    match output {
        Output::Human => {
            println!("owned {} • expected {}", report.owned, report.expected);
            for o in &report.objects {
                println!("{:<18} {}", o.outcome.as_str(), o.key);
            }
            for k in &report.pruned {
                println!("{:<18} {}", "pruned", k);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

fn print_kinds(output: Output, registry: &KindRegistry) -> Result<()> {
    match output {
        Output::Human => {
            for s in registry.iter() {
                let scope = if s.namespaced() { "namespaced" } else { "cluster" };
                let extra = if s.workload { " • workload" } else { "" };
                println!("{} • {} • {}{}", s.kind.api_version(), s.kind.kind, scope, extra);
            }
        }
        Output::Json => {
            let rows: Vec<_> = registry
                .iter()
                .map(|s| serde_json::json!({ "kind": s.kind, "scope": s.scope, "workload": s.workload }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let registry = Arc::new(tether_apply::builtin());
    if let Commands::Kinds = cli.command {
        return print_kinds(cli.output, &registry);
    }

    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::try_default().await?);
    let reconciler = Reconciler::new(store.clone(), registry.clone(), ReconcileConfig::from_env());
    let ns = cli.namespace.as_str();

    match cli.command {
        Commands::Kinds => {}
        Commands::Owned { owner, filter } => {
            let owner = resolve_owner(store.as_ref(), ns, &owner).await?;
            let owned = reconciler.find_owned(&owner, &filter.filter()).await?;
            let keys: Vec<_> = owned.values().filter_map(|o| registry.key_of(o).ok()).collect();
            match cli.output {
                Output::Human => {
                    for k in &keys {
                        println!("{}", k);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&keys)?),
            }
        }
        Commands::Reconcile { owner, filter, file, passes, interval_ms } => {
            let desired = desired::load_desired(&file)?;
            let owner = resolve_owner(store.as_ref(), ns, &owner).await?;
            info!(owner = %owner.key(), objects = desired.len(), passes, "reconcile invoked");
            let result =
                converge_until_interrupted(&reconciler, &owner, &filter, &desired, passes, Duration::from_millis(interval_ms))
                    .await?;
            match result {
                Ok(report) => print_report(cli.output, &report)?,
                Err(ReconcileError::Batch(errors)) => {
                    for e in &errors {
                        eprintln!("{}", e);
                    }
                    return Err(anyhow!("{} object(s) failed to reconcile", errors.len()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Status { owner, declared_version } => {
            let owner = resolve_owner(store.as_ref(), ns, &owner).await?;
            match reconciler.reconcile_status(&owner, declared_version.as_deref()).await {
                Ok(summary) => match cli.output {
                    Output::Human => println!(
                        "ready={} initialized={} version={} replicas ready={}/{}",
                        summary.ready,
                        summary.initialized,
                        summary.version.as_deref().unwrap_or("-"),
                        summary.ready_replicas,
                        summary.replicas
                    ),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                },
                Err(e) => {
                    if let (Some(summary), Output::Json) = (&e.summary, cli.output) {
                        println!("{}", serde_json::to_string_pretty(summary)?);
                    }
                    return Err(e.into());
                }
            }
        }
        Commands::Cleanup { owner, filter } => {
            let owner = resolve_owner(store.as_ref(), ns, &owner).await?;
            let removed = reconciler.cleanup(&owner, &filter.filter()).await?;
            match cli.output {
                Output::Human => {
                    for k in &removed {
                        println!("deleted {}", k);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&removed)?),
            }
        }
    }
    Ok(())
}
