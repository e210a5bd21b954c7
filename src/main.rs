//! LLMesh Node - peer-mesh node binary
//!
//! Joins the signaling relay, keeps direct links to other devices, and
//! serves or sends chat requests over them.

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use llmesh::backend::{OpenAiBackend, OpenAiConfig};
use llmesh::config::{self, NodeConfig};
use llmesh::error::{Error, Result};
use llmesh::logging::{self, LogGuards};
use llmesh::peer::WebRtcLinkFactory;
use llmesh::system::{self, ProbeResult};
use llmesh::types::ChatMessage;
use llmesh::{version, MeshNode};

use crate::cli::{Cli, Commands, ConfigSubcommand};

/// Budget for the startup capability probe
const STARTUP_PROBE_BUDGET: Duration = Duration::from_millis(200);

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Short-lived commands skip config-driven logging
    match &cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand.clone());
        }
        Commands::Probe { budget_ms, json } => {
            logging::init_simple(tracing::Level::WARN)?;
            return run_probe_command(Duration::from_millis(*budget_ms), *json);
        }
        _ => {}
    }

    let config_path = match &cli.command {
        Commands::Run { config, .. } | Commands::Chat { config, .. } => config.clone(),
        _ => None,
    };

    let mut config = match NodeConfig::load(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    };
    if let Some(host) = cli.command.hosting_override() {
        config.hosting.enabled = host;
    }

    // Guards must live until exit so the file writer flushes
    let _log_guards: LogGuards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting LLMesh node"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("llmesh-node")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    match cli.command {
        Commands::Run { .. } => runtime.block_on(run_node(config)),
        Commands::Chat {
            peer,
            model,
            system,
            prompt,
            ..
        } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(prompt));

            match runtime.block_on(run_chat(config, &peer, &model, messages)) {
                Ok(()) => Ok(()),
                Err(e) => {
                    eprintln!("Error: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Version | Commands::Config { .. } | Commands::Probe { .. } => {
            unreachable!("handled before runtime start")
        }
    }
}

/// Build the node: probe (unless the timeout is pinned), backend, WebRTC links
async fn build_node(config: NodeConfig) -> Result<Arc<MeshNode>> {
    let probe: Option<ProbeResult> = if config.peer.connect_timeout_secs.is_none() {
        tokio::task::spawn_blocking(|| system::run_probe(STARTUP_PROBE_BUDGET))
            .await
            .map_err(|e| Error::Internal(format!("probe task failed: {}", e)))
            .map(Some)?
    } else {
        None
    };

    let backend = Arc::new(OpenAiBackend::new(OpenAiConfig::from(&config.openai))?);
    MeshNode::with_probe(config, backend, Arc::new(WebRtcLinkFactory::new()), probe)
}

/// Join the mesh and serve until Ctrl-C
async fn run_node(config: NodeConfig) -> Result<()> {
    info!(
        relay = %config.signaling.url,
        hosting = config.hosting.enabled,
        "Configuration loaded"
    );

    let node = build_node(config).await?;
    node.init().await?;

    let mut status = node.signaling().subscribe_status();
    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Shutdown signal received");
                break;
            }
            update = status.recv() => match update {
                Some(s) => info!(status = %s, "Mesh status changed"),
                None => {
                    warn!("Status channel closed");
                    break;
                }
            }
        }
    }

    node.shutdown().await;
    info!("Node stopped");
    Ok(())
}

/// One-shot client: connect, ask, print, leave
async fn run_chat(config: NodeConfig, peer: &str, model: &str, messages: Vec<ChatMessage>) -> anyhow::Result<()> {
    let mut config = config;
    config.hosting.enabled = false;

    let node = build_node(config).await.context("failed to build node")?;
    node.init().await.context("failed to join the mesh")?;

    let result = node
        .chat(peer, model, messages)
        .await
        .with_context(|| format!("chat with {} failed", peer));
    node.shutdown().await;

    let response = result?;
    println!("{}", response.message.content);
    info!(
        prompt_tokens = response.usage.prompt_tokens,
        completion_tokens = response.usage.completion_tokens,
        "Chat complete"
    );
    Ok(())
}

/// Print the device probe and the timeout it selects
fn run_probe_command(budget: Duration, json: bool) -> Result<()> {
    let result = system::run_probe(budget);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("Device:");
    println!("  Hostname:     {}", result.device.hostname);
    println!("  Platform:     {} ({})", result.device.platform, result.device.arch);
    println!("  CPUs:         {}", result.device.cpu_count);
    println!("  Memory:       {} MB", result.device.total_memory_mb);
    println!("  Hash rate:    {:.0} blocks/s", result.hashes_per_second);
    println!();
    println!(
        "Timeout profile: {} ({}s connect timeout)",
        result.profile,
        result.profile.connect_timeout().as_secs()
    );
    Ok(())
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = NodeConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Wrote {}", written.display());
        }
        ConfigSubcommand::Validate { config } => match NodeConfig::load(config.as_deref()) {
            Ok(_) => println!("Configuration is valid."),
            Err(e) => {
                eprint!("{}", e.format_for_terminal());
                std::process::exit(e.exit_code());
            }
        },
    }

    Ok(())
}
