//! GridMesh - Distributed In-Memory Data Grid Coordination Core
//!
//! Daemon entry point: loads configuration, assembles a grid member and
//! serves the cluster protocol until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridmesh::cluster::ClusterMembership;
use gridmesh::config::GridMeshConfig;
use gridmesh::error::Result;
use gridmesh::lock::LockCoordinator;
use gridmesh::member::GridMember;
use gridmesh::network::{send_once, NetworkServer, TcpMemberChannel};
use gridmesh::replication::{Message, ReplicationConfig};
use gridmesh::routing::{PartitionRouter, PartitionTable};
use gridmesh::security::AllowAll;
use gridmesh::storage::PartitionStore;

/// GridMesh - Distributed In-Memory Data Grid Coordination Core
#[derive(Parser)]
#[command(name = "gridmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "gridmesh.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a grid member
    Start {
        /// Seed this member as the sole owner of every partition
        /// (first member of a new cluster)
        #[arg(long)]
        bootstrap: bool,
    },

    /// Query a member's status
    Status {
        /// Member address to query
        #[arg(short, long, default_value = "localhost:7900")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "gridmesh.toml")]
        output: PathBuf,

        /// Member ID
        #[arg(long, default_value = "member-1")]
        member_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start { bootstrap } => run_start(cli.config, bootstrap).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init { output, member_id } => run_init(output, member_id),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start a grid member
async fn run_start(config_path: PathBuf, bootstrap: bool) -> Result<()> {
    tracing::info!("Starting GridMesh member...");

    let config = match GridMeshConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for member: {}", config.member.id);

    // Cluster view seeded from configured peers. Peer ids arrive with
    // their first heartbeat; addresses are enough to dial.
    let membership = Arc::new(ClusterMembership::new(
        config.member.id.clone(),
        config.advertise_address().to_string(),
        config.heartbeat_interval() * 3,
    ));
    for (index, peer) in config.cluster.peers.iter().enumerate() {
        if peer == config.advertise_address() {
            continue;
        }
        membership
            .add_member(format!("peer-{}", index + 1), peer.clone())
            .await?;
    }

    // Partition table: bootstrap seeds a single-member table; otherwise
    // the membership collaborator supplies one after join
    let router = if bootstrap {
        tracing::info!(
            "Bootstrapping: this member owns all {} partitions",
            config.partition.count
        );
        Arc::new(PartitionRouter::with_table(
            config.partition.count,
            PartitionTable::single_member(config.partition.count, config.member.id.clone()),
        ))
    } else {
        Arc::new(PartitionRouter::new(config.partition.count))
    };

    let channel = Arc::new(TcpMemberChannel::new(
        Arc::clone(&membership),
        Duration::from_millis(config.invocation.connect_timeout_ms),
        config.request_timeout(),
    ));

    let member = GridMember::new(
        config.member.id.clone(),
        Arc::clone(&membership),
        router,
        Arc::new(PartitionStore::new(config.partition.count)),
        Arc::new(LockCoordinator::new(&config.lock)),
        channel,
        Arc::new(AllowAll),
        ReplicationConfig::from(&config.backup),
    );

    // Serve the cluster protocol
    let server = Arc::new(NetworkServer::new(
        config.member.bind_address.clone(),
        member.handler(),
    ));
    let listener = server.bind().await?;
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    // Heartbeats and failure sweeps
    let heartbeat_task = {
        let member = Arc::clone(&member);
        let interval = config.heartbeat_interval();
        tokio::spawn(async move { member.run(interval).await })
    };

    tracing::info!("Member {} started", member.id());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, shutting down");

    member.begin_shutdown().await;
    server.stop();
    heartbeat_task.abort();
    let _ = server_task.await;

    Ok(())
}

/// Query a member's status
async fn run_status(address: String) -> Result<()> {
    let response = send_once(&address, Message::StatusRequest, Duration::from_secs(5)).await?;

    match response {
        Message::StatusResponse {
            member_id,
            table_version,
            owned_partitions,
            live_locks,
            entries,
        } => {
            let status = serde_json::json!({
                "member_id": member_id,
                "table_version": table_version,
                "owned_partitions": owned_partitions,
                "live_locks": live_locks,
                "entries": entries,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        other => {
            tracing::error!("Unexpected response: {}", other.type_name());
        }
    }

    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, member_id: String) -> Result<()> {
    use gridmesh::config::*;

    let config = GridMeshConfig {
        member: MemberConfig {
            id: member_id,
            bind_address: "0.0.0.0:7900".to_string(),
            advertise_address: None,
        },
        partition: PartitionConfig::default(),
        lock: LockConfig::default(),
        backup: BackupConfig::default(),
        invocation: InvocationSettings::default(),
        cluster: ClusterConfig::default(),
        logging: LoggingConfig::default(),
    };

    let content = toml::to_string_pretty(&config)
        .map_err(|e| gridmesh::Error::Config(e.to_string()))?;
    std::fs::write(&output, content)?;
    println!("Configuration written to {:?}", output);

    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match GridMeshConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid for member '{}'", config.member.id);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            Err(e)
        }
    }
}
