//! hostdiag binary.
//!
//! `hostdiag serve` (the default) exposes the HTTP API; `hostdiag run`
//! executes one session in the foreground and prints its final status.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use hostdiag::catalog::TaskCatalog;
use hostdiag::config::Config;
use hostdiag::package::OutputFormat;
use hostdiag::privilege::{HostPrivilege, PrivilegeContext};
use hostdiag::session::SessionScheduler;

#[derive(Parser)]
#[command(name = "hostdiag", about = "Collect host diagnostics into a report bundle", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the diagnostic tasks available on this host
    List,

    /// Run a diagnostic session in the foreground
    Run {
        /// Comma-separated task ids (default: everything runnable at the
        /// current privilege level)
        #[arg(short, long, value_delimiter = ',')]
        tasks: Option<Vec<String>>,

        /// Bundle format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Both)]
        format: OutputFormat,

        /// Directory for scratch files and the final bundle
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Start the HTTP server
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hostdiag=info,tower_http=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;

    match cli.command {
        Some(Commands::List) => list_tasks(),
        Some(Commands::Run {
            tasks,
            format,
            output,
        }) => {
            if let Some(dir) = output {
                config.output_dir = dir;
            }
            run_session(config, tasks, format).await
        }
        Some(Commands::Serve { host, port }) => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            serve(config).await
        }
        None => serve(config).await,
    }
}

fn build_scheduler(config: &Config) -> Arc<SessionScheduler> {
    let privilege = Arc::new(HostPrivilege::detect());
    Arc::new(SessionScheduler::new(
        Arc::new(TaskCatalog::builtin()),
        privilege,
        config,
    ))
}

fn list_tasks() -> anyhow::Result<()> {
    let elevated = HostPrivilege::detect().is_elevated();
    let catalog = TaskCatalog::builtin();

    println!("{:<28} {:<12} {}", "ID", "CATEGORY", "NAME");
    for info in catalog.infos() {
        let category = serde_json::to_value(info.category)?;
        let marker = if info.admin_required && !elevated {
            " (requires elevation)"
        } else {
            ""
        };
        println!(
            "{:<28} {:<12} {}{}",
            info.id,
            category.as_str().unwrap_or("other"),
            info.name,
            marker
        );
    }
    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .with_context(|| format!("Failed to create output directory {}", config.output_dir.display()))?;

    let scheduler = build_scheduler(&config);
    tracing::info!(
        tasks = scheduler.catalog().len(),
        elevated = scheduler.is_elevated(),
        max_concurrency = config.max_concurrency,
        "Starting hostdiag server"
    );
    hostdiag::api::serve(config, scheduler).await
}

async fn run_session(
    config: Config,
    tasks: Option<Vec<String>>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let scheduler = build_scheduler(&config);

    let selected = match tasks {
        Some(ids) => ids
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect(),
        None => scheduler.catalog().available(scheduler.is_elevated()),
    };

    let session = scheduler
        .create_and_start(selected, format)
        .await
        .context("Failed to start diagnostic session")?;
    let id = session.id;
    tracing::info!(session_id = %id, tasks = session.task_states.len(), "Session started");

    let mut snapshots = scheduler.subscribe(id).await?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancel_requested = false;

    loop {
        tokio::select! {
            snapshot = snapshots.next() => {
                let Some(snapshot) = snapshot else { break };
                eprintln!(
                    "[{:>3.0}%] {}/{} {}",
                    snapshot.progress * 100.0,
                    snapshot.completed_tasks,
                    snapshot.total_tasks,
                    snapshot.current_tasks.join(", ")
                );
            }
            signal = &mut ctrl_c, if !cancel_requested => {
                cancel_requested = true;
                if let Err(e) = signal {
                    tracing::warn!("Ctrl+C handler failed: {}", e);
                    continue;
                }
                eprintln!("Cancelling...");
                scheduler.cancel(id).await?;
            }
        }
    }

    let summary = scheduler.status(id).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
