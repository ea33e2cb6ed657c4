mod topology;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gbasedeploy_cluster::{Cluster, ClusterConfig, Node, NodeSpec};
use gbasedeploy_exec::{LocalExecutor, MachineRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use topology::{NodeDecl, TopologySpec};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "gbasedeploy",
    about = "GBase 8s cluster deployment and orchestration",
    version
)]
struct Cli {
    /// Topology declaration file
    #[arg(long, default_value = "topology.yaml")]
    topology: PathBuf,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize storage on every node and bring the topology up
    Init,
    /// Start an already-initialized topology (primary first, then secondaries)
    Start,
    /// Stop every node, secondaries first
    Stop,
    /// Show per-secondary replication status as seen by the primary
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let spec = topology::load(&cli.topology)?;
    info!(
        cluster = %spec.cluster.name,
        topology = %cli.topology.display(),
        "topology loaded"
    );
    let registry = MachineRegistry::new(Arc::new(LocalExecutor::new()));
    let mut cluster = build_cluster(spec, &registry).await?;

    match cli.command {
        Command::Init => {
            cluster.startup().await?;
            println!("cluster initialized and started");
        }
        Command::Start => {
            cluster.mark_initialized();
            cluster.startup().await?;
            println!("cluster started");
        }
        Command::Stop => {
            cluster.mark_initialized();
            cluster.shutdown().await?;
            println!("cluster stopped");
        }
        Command::Status { json } => {
            let statuses = cluster.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else if statuses.is_empty() {
                println!("no secondaries reported");
            } else {
                println!("{:<20} {:<14} {:<40} {}", "server", "replay log", "connection", "ok");
                for s in &statuses {
                    println!(
                        "{:<20} {:<14} {:<40} {}",
                        s.name,
                        s.replay_log,
                        s.connection,
                        if s.is_ok() { "yes" } else { "no" }
                    );
                }
            }
        }
    }
    Ok(())
}

async fn build_cluster(spec: TopologySpec, registry: &MachineRegistry) -> Result<Cluster> {
    let mut config = ClusterConfig {
        group_name: format!("g_{}", spec.cluster.name),
        startup_timeout: Duration::from_secs(spec.cluster.startup_timeout_secs),
        ..ClusterConfig::default()
    };
    if let Some(dir) = spec.cluster.staging_dir {
        config.staging_dir = dir;
    }

    let mut cluster = Cluster::new(make_node(&spec.primary, registry), config);
    for decl in &spec.sds {
        cluster.add_sds(make_node(decl, registry)).await?;
    }
    for decl in &spec.rss {
        cluster.add_rss(make_node(decl, registry)).await?;
    }
    if let Some(decl) = &spec.hdr {
        cluster.add_hdr(make_node(decl, registry)).await?;
    }
    Ok(cluster)
}

fn make_node(decl: &NodeDecl, registry: &MachineRegistry) -> Node {
    let machine = registry.machine(&decl.host);
    let spec = NodeSpec {
        name: decl.name.clone(),
        host: decl.host.clone(),
        port: decl.port,
        install_dir: decl.install_dir.clone(),
        storage_dir: decl.storage_dir.clone(),
        owner: decl.owner.clone(),
        root_size_kb: decl.root_size_kb,
    };
    Node::new(spec, machine)
}
