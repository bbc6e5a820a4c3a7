//! opsentry worker and operational CLI.
//!
//! `run` starts a worker that recovers unfinished incidents and consumes
//! the ingress queue; `verify`, `replay`, and `escalate` operate on the
//! durable event log for one incident; `config show` prints the effective
//! configuration.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use opsentry::config::{Config, ConfigLoader};
use opsentry::consensus::{AllowAllVerifier, ConsensusEngine};
use opsentry::fabric::Fabric;
use opsentry::orchestrator::{
    AgentRegistry, Dependencies, FileCheckpointStore, LocalCredentialBroker, Orchestrator,
};
use opsentry::security::{ActionWhitelist, SecurityGate};
use opsentry::store::{replay, verify_chain, ChainStatus, FileEventLog};
use opsentry::EscalationReason;

/// Autonomous incident response engine
#[derive(Parser)]
#[command(name = "opsentry")]
#[command(about = "Autonomous incident response - agent swarm with audited consensus")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker: recover unfinished incidents and serve ingress
    Run,

    /// Verify the integrity chain of one incident
    Verify {
        /// Incident id
        incident_id: String,
    },

    /// Replay one incident and print its aggregate
    Replay {
        /// Incident id
        incident_id: String,
    },

    /// Force-terminate an incident
    Escalate {
        /// Incident id
        incident_id: String,
        /// Reason recorded in the escalation event
        reason: String,
    },

    /// Configuration utilities
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let mut loader = ConfigLoader::new_with_search_paths();
    if let Some(path) = &cli.config {
        loader.add_search_path(path.clone());
    }
    let loaded = loader.load_with_fallback().context("loading configuration")?;
    if loaded.fallback_used {
        warn!("running on default configuration");
    }
    let config = loaded.config;

    match cli.command {
        Commands::Run => run_worker(config).await,
        Commands::Verify { incident_id } => verify_incident(config, &incident_id).await,
        Commands::Replay { incident_id } => replay_incident(config, &incident_id).await,
        Commands::Escalate { incident_id, reason } => {
            escalate_incident(config, &incident_id, &reason).await
        }
        Commands::Config { show } => {
            if show {
                println!("{}", toml::to_string_pretty(&config)?);
            }
            Ok(())
        }
    }
}

async fn open_store(config: &Config) -> Result<Arc<FileEventLog>> {
    let root = config.store.root.clone().unwrap_or_else(|| config.data_dir().join("events"));
    Ok(Arc::new(
        FileEventLog::new(&root, config.store.partitions)
            .await
            .with_context(|| format!("opening event log at {}", root.display()))?,
    ))
}

async fn build_orchestrator(config: Config) -> Result<Orchestrator> {
    let store = open_store(&config).await?;
    let checkpoints = Arc::new(
        FileCheckpointStore::new(config.data_dir().join("checkpoints"))
            .await
            .context("opening checkpoint store")?,
    );
    let fabric = Arc::new(Fabric::new(&config.fabric));
    let consensus =
        ConsensusEngine::new(config.consensus.clone(), Arc::new(AllowAllVerifier));
    let gate = SecurityGate::new(ActionWhitelist::builtin());

    // Agent connectors and the actuator are wired by the integration layer
    // embedding this crate; a bare worker still recovers, escalates, and
    // serves the audit surface.
    let deps = Dependencies {
        store,
        checkpoints,
        fabric,
        agents: AgentRegistry::new(),
        actuator: Arc::new(NoopActuator),
        broker: Arc::new(LocalCredentialBroker),
        gate,
        consensus,
    };
    Ok(Orchestrator::new(config, deps))
}

async fn run_worker(config: Config) -> Result<()> {
    let orchestrator = build_orchestrator(config).await?;
    info!(owner = orchestrator.owner_id(), "worker starting");

    let resumed = orchestrator.recover().await?;
    info!(resumed, "resumed unfinished incidents");

    let (queue, receiver) = opsentry::bus::ingress_channel(1024);
    let shutdown = tokio_util::sync::CancellationToken::new();
    let ingress = tokio::spawn(opsentry::bus::run_ingress(
        receiver,
        orchestrator.clone(),
        shutdown.clone(),
    ));
    // The queue handle stays alive for embedders feeding this worker.
    let _queue = queue;

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    shutdown.cancel();
    orchestrator.shutdown().await;
    let _ = ingress.await;
    Ok(())
}

async fn verify_incident(config: Config, incident_id: &str) -> Result<()> {
    let store = open_store(&config).await?;
    match verify_chain(store.as_ref(), incident_id).await? {
        ChainStatus::Ok { length } => {
            println!("chain ok: {length} events");
            Ok(())
        }
        ChainStatus::Broken { first_broken_sequence } => {
            bail!("chain broken at sequence {first_broken_sequence}")
        }
    }
}

async fn replay_incident(config: Config, incident_id: &str) -> Result<()> {
    let store = open_store(&config).await?;
    let incident = replay(store.as_ref(), incident_id).await?;
    println!("{}", serde_json::to_string_pretty(&incident)?);
    Ok(())
}

async fn escalate_incident(config: Config, incident_id: &str, reason: &str) -> Result<()> {
    let orchestrator = build_orchestrator(config).await?;
    orchestrator
        .escalate(incident_id, EscalationReason::OperatorRequest, reason)
        .await?;
    println!("incident {incident_id} escalated");
    Ok(())
}

/// Actuator used by the bare worker binary: refuses every execution, so
/// nothing runs without a real actuator wired in.
#[derive(Debug)]
struct NoopActuator;

#[async_trait::async_trait]
impl opsentry::orchestrator::ActionExecutor for NoopActuator {
    async fn sandbox_test(
        &self,
        _incident_id: &str,
        _action_id: &str,
        _payload: &serde_json::Value,
    ) -> Result<String, opsentry::fabric::UpstreamError> {
        Err(opsentry::fabric::UpstreamError::permanent("no actuator configured"))
    }

    async fn execute(
        &self,
        _action_id: &str,
        _payload: &serde_json::Value,
        _credentials: &opsentry::security::CredentialHandle,
        _idempotency_key: &str,
    ) -> Result<String, opsentry::fabric::UpstreamError> {
        Err(opsentry::fabric::UpstreamError::permanent("no actuator configured"))
    }

    async fn health_check(
        &self,
        _incident_id: &str,
        _invariants: &[String],
    ) -> Result<bool, opsentry::fabric::UpstreamError> {
        Err(opsentry::fabric::UpstreamError::permanent("no actuator configured"))
    }

    async fn rollback(
        &self,
        _action_id: &str,
        _rollback_template_id: Option<&str>,
    ) -> Result<(), opsentry::fabric::UpstreamError> {
        Err(opsentry::fabric::UpstreamError::permanent("no actuator configured"))
    }
}
