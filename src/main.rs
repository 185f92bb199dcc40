//! cirrina - Collaborative State Machine Runtime
//!
//! Loads a collaborative state machine description and runs its state
//! machines until interrupted.

use cirrina_core::{CollaborativeStateMachineClassBuilder, CollaborativeStateMachineDescription};
use cirrina_runtime::{
    create_broker, Config, InMemoryCoordination, JobMonitor, KeyValueContext,
    MemoryKeyValueStore, Runtime, ServiceImplementationSelector,
};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cirrina", version, about = "Collaborative state machine runtime")]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long, env = "CIRRINA_CONFIG")]
    config: Option<PathBuf>,

    /// Collaborative state machine description (JSON, or YAML by extension)
    #[arg(long)]
    csm: PathBuf,

    /// State machines to instantiate (default: every concrete top-level machine)
    #[arg(short, long = "machine")]
    machines: Vec<String>,
}

fn load_description(
    path: &Path,
) -> Result<CollaborativeStateMachineDescription, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        Ok(serde_yaml::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(&content)?)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match Config::load_with(args.config.as_deref()) {
        Ok(c) => {
            if let Some(path) = &args.config {
                tracing::info!("Loaded config from {}", path.display());
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    let description = load_description(&args.csm)?;
    let csm = CollaborativeStateMachineClassBuilder::new(&description).build()?;

    tracing::info!("Starting cirrina runtime '{}'", config.runtime.name);
    tracing::info!("  Collaborative state machine: {} ({})", csm.name(), csm.version());
    tracing::info!(
        "  Routing graph: {} vertices, {} edges",
        csm.vertices().len(),
        csm.edges().len()
    );

    let broker = create_broker(config.broker.channel_capacity);
    let persistent = Arc::new(KeyValueContext::new(
        Arc::new(MemoryKeyValueStore::new()),
        "persistent",
    ));
    let runtime = Runtime::new(
        config.runtime.clone(),
        persistent,
        broker,
        ServiceImplementationSelector::new(),
    );
    let scheduler = runtime.run();

    // Job monitor
    let monitor = if config.coordination.enabled {
        let coordination = Arc::new(InMemoryCoordination::new(config.broker.channel_capacity));
        let monitor = Arc::new(JobMonitor::new(
            runtime.clone(),
            coordination,
            config.coordination.clone(),
        )?);
        tracing::info!("  Job monitor: watching {}", config.coordination.jobs_path);
        Some((monitor.clone(), monitor.run()))
    } else {
        tracing::info!("  Job monitor: disabled");
        None
    };

    let names: Vec<String> = if args.machines.is_empty() {
        csm.state_machines()
            .iter()
            .filter(|machine| !machine.is_abstract())
            .map(|machine| machine.name().to_string())
            .collect()
    } else {
        args.machines.clone()
    };
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let ids = runtime.new_instances(&csm, &names)?;
    tracing::info!("Instantiated {} state machine instance(s)", ids.len());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping runtime...");

    if let Some((monitor, handle)) = monitor {
        monitor.stop();
        let _ = handle.await;
    }

    if !runtime.shutdown(config.runtime.shutdown_timeout()).await {
        tracing::warn!("Some commands were still running at exit");
    }
    let _ = scheduler.await;

    tracing::info!("Runtime stopped");
    Ok(())
}
