use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use am_domain::config::EngineConfig;
use am_domain::run::RunState;
use am_engine::Client;
use am_model::mock::MockModelClient;
use am_store::{MemoryStore, PostgresStore, RunFilter, Store};

#[derive(Parser)]
#[command(name = "agentmesh", version, about = "Distributed agent execution engine")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Postgres connection string; omit for an ephemeral in-memory store
    /// (development only).
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker instance until interrupted.
    Serve,
    /// Print instance and run-state counts.
    Status,
    /// Compact one session's history now.
    Compact {
        #[arg(long)]
        session: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(cli.config.as_deref())?;
    let store = open_store(cli.database_url.as_deref(), &config).await?;

    match cli.command {
        None | Some(Command::Serve) => serve(store, config).await,
        Some(Command::Status) => status(store.as_ref()).await,
        Some(Command::Compact { session }) => compact(store, config, session).await,
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,am_engine=debug")),
        )
        .init();
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

async fn open_store(database_url: Option<&str>, config: &EngineConfig) -> anyhow::Result<Arc<dyn Store>> {
    match database_url {
        Some(url) => {
            let max = (config.instance.max_concurrent_runs + config.instance.max_concurrent_tools).max(8);
            let store = PostgresStore::connect(url, max).await.context("connecting to postgres")?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("no DATABASE_URL given; using an ephemeral in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn serve(store: Arc<dyn Store>, config: EngineConfig) -> anyhow::Result<()> {
    // The in-tree model client is the scripted mock; production deployments
    // embed the engine as a library and supply a real adapter.
    let model = Arc::new(MockModelClient::new());
    let client = Client::new(store, model, config)?;
    client.start().await?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");
    client.stop().await?;
    Ok(())
}

async fn status(store: &dyn Store) -> anyhow::Result<()> {
    let instances = store.list_instances().await?;
    println!("instances: {}", instances.len());
    for instance in instances {
        println!(
            "  {} {} runs={} tools={} heartbeat={}",
            instance.id, instance.name, instance.active_run_count, instance.active_tool_count,
            instance.last_heartbeat_at.format("%H:%M:%S"),
        );
    }
    if let Some(leader) = store.current_leader().await? {
        println!("leader: {} (expires {})", leader.leader_id, leader.expires_at.format("%H:%M:%S"));
    } else {
        println!("leader: none");
    }

    for state in [
        RunState::Pending,
        RunState::PendingApi,
        RunState::BatchPending,
        RunState::BatchProcessing,
        RunState::Streaming,
        RunState::PendingTools,
        RunState::Completed,
        RunState::Failed,
        RunState::Cancelled,
    ] {
        let (_, total) = store
            .list_runs(&RunFilter {
                state: Some(state),
                limit: 1,
                ..Default::default()
            })
            .await?;
        if total > 0 {
            println!("runs {}: {}", state.as_str(), total);
        }
    }
    Ok(())
}

async fn compact(store: Arc<dyn Store>, config: EngineConfig, session: Uuid) -> anyhow::Result<()> {
    let model = Arc::new(MockModelClient::new());
    let compactor = am_compaction::Compactor::new(store, model, config.compaction);
    let result = compactor.compact(session).await?;
    println!(
        "compacted session {session}: {} -> {} tokens, {} messages removed, summary={}",
        result.event.original_tokens,
        result.event.compacted_tokens,
        result.event.messages_removed,
        result.summary_created,
    );
    Ok(())
}
