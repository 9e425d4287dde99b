use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use robotbench::channel::ChannelSupervisor;
use robotbench::config::Config;
use robotbench::orchestrator::Orchestrator;
use robotbench::registry::HttpCommander;

#[derive(Parser)]
#[command(
    name = "robotbench",
    about = "Cross-platform robot test orchestration: one test, every platform, one comparison",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (falls back to ROBOTBENCH_CONFIG,
    /// then /etc/robotbench/robotbench.toml, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a test case on one or more platforms and compare results
    Run {
        /// Test case key
        #[arg(long)]
        case: String,

        /// Comma-separated platform keys, e.g. real_robot,gazebo
        #[arg(long, value_delimiter = ',')]
        platforms: Vec<String>,

        /// Write the export document (results + comparison) to a file
        #[arg(long)]
        export: Option<PathBuf>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List configured test cases
    Cases,

    /// Inspect or control platform connections
    Platforms {
        #[command(subcommand)]
        action: PlatformAction,
    },
}

#[derive(Subcommand)]
enum PlatformAction {
    /// List configured platforms
    List,

    /// Connect a platform via its control endpoint
    Connect {
        /// Platform key
        #[arg(long)]
        key: String,
    },

    /// Disconnect a platform via its control endpoint
    Disconnect {
        /// Platform key
        #[arg(long)]
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(),
    };

    match cli.command {
        Commands::Run {
            case,
            platforms,
            export,
            json,
        } => {
            run_test(&config, &case, platforms, export, json).await?;
        }
        Commands::Cases => {
            println!("{:<16} | {:<24} | Steps | Description", "Key", "Name");
            println!("{:-<16}-|-{:-<24}-|-------|-{:-<30}", "", "", "");
            for case in &config.test_cases {
                println!(
                    "{:<16} | {:<24} | {:<5} | {}",
                    case.key,
                    case.name,
                    case.steps.len(),
                    case.description
                );
            }
        }
        Commands::Platforms { action } => match action {
            PlatformAction::List => {
                println!("{:<16} | {:<24} | Control endpoint", "Key", "Name");
                println!("{:-<16}-|-{:-<24}-|-{:-<30}", "", "", "");
                for p in &config.platforms {
                    println!("{:<16} | {:<24} | {}", p.key, p.display_name, p.control_url);
                }
            }
            PlatformAction::Connect { key } => {
                let (handle, _join) = start_orchestrator(&config);
                handle.connect_platform(&key).await?;
                println!("Platform '{key}' connected.");
            }
            PlatformAction::Disconnect { key } => {
                let (handle, _join) = start_orchestrator(&config);
                handle.disconnect_platform(&key).await?;
                println!("Platform '{key}' disconnected.");
            }
        },
    }

    Ok(())
}

fn start_orchestrator(
    config: &Config,
) -> (
    robotbench::orchestrator::OrchestratorHandle,
    tokio::task::JoinHandle<()>,
) {
    let supervisor = Arc::new(ChannelSupervisor::new(
        config.channel.endpoint.clone(),
        config.channel.base_delay(),
        config.channel.max_attempts,
    ));
    let commander = Arc::new(HttpCommander::new(&config.platforms));
    let (orchestrator, handle) = Orchestrator::new(config, commander, supervisor);
    let join = orchestrator.spawn();
    (handle, join)
}

async fn run_test(
    config: &Config,
    case: &str,
    platforms: Vec<String>,
    export: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let supervisor = Arc::new(ChannelSupervisor::new(
        config.channel.endpoint.clone(),
        config.channel.base_delay(),
        config.channel.max_attempts,
    ));
    let commander = Arc::new(HttpCommander::new(&config.platforms));
    let (orchestrator, handle) = Orchestrator::new(config, commander, Arc::clone(&supervisor));
    orchestrator.spawn();

    tracing::info!(endpoint = %config.channel.endpoint, "opening backend channel");
    supervisor.connect();
    supervisor
        .wait_open(Duration::from_secs(30))
        .await
        .context("backend channel did not open")?;

    for key in &platforms {
        handle
            .connect_platform(key)
            .await
            .with_context(|| format!("failed to bring platform '{key}' online"))?;
    }

    let run_id = handle.start_run(case, platforms).await?;
    tracing::info!(%run_id, "run accepted, waiting for platforms");

    let state = handle.wait_for_run(&run_id).await?;
    tracing::info!(%run_id, state = ?state, "run finished");

    let summary = handle.summarize(&run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("\n=== Run {} ({:?}) ===", run_id, state);
        println!("{:<16} | {:<8} | Detail", "Platform", "Result");
        println!("{:-<16}-|-{:-<8}-|-{:-<40}", "", "", "");
        for (platform, result) in &summary.results {
            let status = if result.success { "PASS" } else { "FAIL" };
            let detail = result.error.as_deref().unwrap_or("-");
            println!("{:<16} | {:<8} | {}", platform, status, detail);
        }
        println!(
            "\nSuccess rate: {:.0}%  ({} passed, {} failed)",
            summary.success.success_rate * 100.0,
            summary.success.succeeded.len(),
            summary.success.failed.len()
        );
        if !summary.metric_deltas.is_empty() {
            println!("\nMetric deltas:");
            for d in &summary.metric_deltas {
                println!(
                    " - {}: {} {:.3} vs {} {:.3} (delta {:+.3})",
                    d.metric, d.platform_a, d.value_a, d.platform_b, d.value_b, d.delta
                );
            }
        }
        for u in &summary.unpaired_metrics {
            println!(" - {} only on {}: {:.3}", u.metric, u.platform, u.value);
        }
        println!();
    }

    if let Some(path) = export {
        let doc = handle.export(&run_id).await?;
        let bytes = serde_json::to_vec_pretty(&doc)?;
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed to write export to {}", path.display()))?;
        tracing::info!(path = %path.display(), "export written");
    }

    let failures = handle.disconnect_all().await?;
    for (key, e) in failures {
        tracing::warn!(platform = %key, error = %e, "disconnect failed during shutdown");
    }
    supervisor.close();
    Ok(())
}
