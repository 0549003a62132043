use crate::api::AdminApi;
use crate::config::MonConfig;
use crate::fixture::{StaticNetwork, StaticSource};
use crate::model::{Cluster, ClusterId, SeverityCounts};
use crate::net::{NetworkProbe, SystemNetwork};
use crate::refresh::{seed_clusters, RefreshReport, Refresher, RestConnector};
use crate::snapshot::SnapshotBuilder;
use crate::store::{ClusterRecords, ClusterStore, ClusterTxn, JsonFileStore, MemoryStore};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "cephmon")]
#[command(about = "Ceph cluster state monitor", long_about = None)]
pub struct Cli {
    #[arg(short, long, env = "CEPHMON_CONFIG", default_value = "/etc/cephmon/cephmon.toml")]
    pub config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Refresh every registered cluster once.
    Refresh,
    /// Refresh every cluster at the configured interval.
    Watch,
    /// Serve the read API and refresh in the background.
    Serve,
    Cluster {
        #[command(subcommand)]
        cmd: ClusterCmd,
    },
    /// Print the counters of a cluster's last snapshot.
    Status {
        id: ClusterId,
    },
    /// Build a snapshot from saved REST API responses and print it.
    Replay {
        #[arg(short, long)]
        dir: PathBuf,
        /// Treat every DNS lookup and monitor probe as failed.
        #[arg(long)]
        offline: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ClusterCmd {
    Add {
        name: String,
        api_base_url: String,
    },
    List,
    Remove {
        id: ClusterId,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = MonConfig::load_or_default(&self.config)?;
        match self.command {
            Command::Refresh => refresh(&config).await,
            Command::Watch => watch(&config).await,
            Command::Serve => serve(config).await,
            Command::Cluster { ref cmd } => cluster(&config, cmd),
            Command::Status { id } => status(&config, id),
            Command::Replay { ref dir, offline } => replay(&config, dir, offline).await,
        }
    }
}

pub fn open_store(config: &MonConfig) -> Result<Arc<dyn ClusterStore>> {
    let store: Arc<dyn ClusterStore> = match &config.store_path {
        Some(path) => Arc::new(JsonFileStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };
    seed_clusters(store.as_ref(), &config.clusters)?;
    Ok(store)
}

pub fn build_refresher(config: &MonConfig, store: Arc<dyn ClusterStore>) -> Result<Refresher> {
    Ok(Refresher::new(
        store,
        Arc::new(SystemNetwork::new(config.monitor_timeout(), config.dns_timeout())),
        Arc::new(RestConnector::new(config.restapi_timeout())?),
        config.build_options(),
    ))
}

async fn refresh(config: &MonConfig) -> Result<()> {
    let store = open_store(config)?;
    let report = build_refresher(config, store)?.refresh_all().await?;
    print_report(&report);
    Ok(())
}

async fn watch(config: &MonConfig) -> Result<()> {
    let store = open_store(config)?;
    build_refresher(config, store)?
        .run_forever(config.refresh_interval())
        .await;
    Ok(())
}

async fn serve(config: MonConfig) -> Result<()> {
    let store = open_store(&config)?;
    let refresher = build_refresher(&config, store.clone())?;
    let interval = config.refresh_interval();
    let refresh_handle = tokio::spawn(async move { refresher.run_forever(interval).await });

    let api = AdminApi::new(store, Arc::new(config));
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.serve().await {
            tracing::error!("API serve error: {}", e);
        }
    });

    tokio::select! {
        _ = refresh_handle => {}
        _ = api_handle => {}
    }
    Ok(())
}

fn cluster(config: &MonConfig, cmd: &ClusterCmd) -> Result<()> {
    let store = open_store(config)?;
    match cmd {
        ClusterCmd::Add { name, api_base_url } => {
            let cluster = store.add_cluster(name, api_base_url)?;
            println!("Added cluster {} ({})", cluster.id, cluster.name);
        }
        ClusterCmd::List => {
            for cluster in store.clusters()? {
                println!("{:>4}  {:<20} {}  {}", cluster.id, cluster.name, cluster.api_base_url, state_label(&cluster));
            }
        }
        ClusterCmd::Remove { id } => {
            store.remove_cluster(*id)?;
            println!("Removed cluster {}", id);
        }
    }
    Ok(())
}

fn status(config: &MonConfig, id: ClusterId) -> Result<()> {
    let store = open_store(config)?;
    let cluster = store.cluster(id)?;

    println!("Cluster: {} ({})", cluster.name, state_label(&cluster));
    if let Some(at) = cluster.update_time {
        println!("Last update: {}", at.to_rfc3339());
    }
    if let Some(msg) = &cluster.update_error_msg {
        let origin = if cluster.update_error_isclient { "client" } else { "server" };
        println!("Last error ({}): {}", origin, msg);
    }

    let Some(snapshot) = cluster.snapshot else {
        println!("No snapshot yet");
        return Ok(());
    };
    println!(
        "Space: {} used of {} ({} free)",
        format_bytes(snapshot.space.used_bytes),
        format_bytes(snapshot.space.capacity_bytes),
        format_bytes(snapshot.space.free_bytes)
    );
    let counters = &snapshot.counters;
    for (name, counts) in [
        ("osd", &counters.osd),
        ("mon", &counters.mon),
        ("mds", &counters.mds),
        ("pg", &counters.pg),
    ] {
        println!("{}", counter_line(name, counts));
    }
    println!("pools: {}", counters.pool.total);
    for (field, affected) in &counters.pool.fields {
        if *affected > 0 {
            println!("  {}: {}", field, affected);
        }
    }
    Ok(())
}

async fn replay(config: &MonConfig, dir: &Path, offline: bool) -> Result<()> {
    let source = StaticSource::from_dir(dir)?;
    let net: Box<dyn NetworkProbe> = if offline {
        Box::new(StaticNetwork::new())
    } else {
        Box::new(SystemNetwork::new(config.monitor_timeout(), config.dns_timeout()))
    };
    let options = config.build_options();

    let mut txn = ClusterTxn::new(0, ClusterRecords::default());
    let snapshot = SnapshotBuilder::new(&source, net.as_ref(), &options)
        .build(&mut txn)
        .await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn print_report(report: &RefreshReport) {
    for outcome in &report.outcomes {
        match &outcome.error {
            None => println!(
                "{:>4}  {:<20} ok (+{} ~{} -{})",
                outcome.cluster_id,
                outcome.name,
                outcome.changes.created,
                outcome.changes.updated,
                outcome.changes.deleted
            ),
            Some(e) => println!("{:>4}  {:<20} FAILED: {}", outcome.cluster_id, outcome.name, e.message),
        }
    }
}

fn state_label(cluster: &Cluster) -> String {
    if cluster.has_error() {
        return "error".to_string();
    }
    cluster
        .snapshot
        .as_ref()
        .map(|s| s.health.overall_status.clone())
        .unwrap_or_else(|| "never refreshed".to_string())
}

fn counter_line(name: &str, counts: &SeverityCounts) -> String {
    format!(
        "{:<5} ok {:>5}  warn {:>5}  critical {:>5}",
        name, counts.ok.count, counts.warn.count, counts.critical.count
    )
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
