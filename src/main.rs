use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use launchpad::config::Config;
use launchpad::extensions::{ExtensionHost, ExtensionManager, ExtensionSnapshot};
use launchpad::logging;

/// Launchpad - manage the extensions of the desktop launcher
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Application data root (overrides the configured one)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List discovered extensions
    List {
        /// Print snapshots as JSON
        #[arg(long)]
        json: bool,
    },
    /// Enable an extension disabled by the user
    Enable { id: String },
    /// Disable an extension
    Disable { id: String },
    /// Run one reload cycle and print the result
    Reload,
    /// Keep extensions loaded and hot reload on changes until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init(args.debug)?;

    let mut config = if let Some(config_path) = &args.config {
        Config::load_from_file(config_path)?
    } else {
        Config::load_default()?
    };

    // One-shot commands never need a watcher
    if !matches!(args.command, Command::Watch) {
        config.extensions.watch_for_changes = false;
    }

    let mut builder = ExtensionManager::builder(config);
    if let Some(root) = args.root {
        builder = builder.root(root);
    }

    let host = ExtensionHost::new();
    let manager = host.install(builder.build().context("Failed to create extension manager")?);
    manager.initialize();

    let result = run(&manager, args.command).await;

    host.shutdown();
    result
}

async fn run(manager: &ExtensionManager, command: Command) -> Result<()> {
    match command {
        Command::List { json } => print_snapshots(&manager.snapshot(), json),
        Command::Enable { id } => {
            manager
                .try_enable(&id)
                .with_context(|| format!("Failed to enable `{id}`"))?;
            print_snapshots(&manager.snapshot(), false)
        }
        Command::Disable { id } => {
            manager
                .try_disable(&id)
                .with_context(|| format!("Failed to disable `{id}`"))?;
            print_snapshots(&manager.snapshot(), false)
        }
        Command::Reload => {
            manager.reload_extensions();
            print_snapshots(&manager.snapshot(), false)
        }
        Command::Watch => watch(manager).await,
    }
}

async fn watch(manager: &ExtensionManager) -> Result<()> {
    let mut changes = manager.subscribe();

    print_snapshots(&manager.snapshot(), false)?;
    if !manager.is_watching() {
        warn!("Hot reload is unavailable; waiting for Ctrl-C only");
    }
    info!(dir = %manager.extensions_dir().display(), "Watching for extension changes (Ctrl-C to stop)");

    loop {
        tokio::select! {
            received = changes.recv() => match received {
                Ok(snapshots) => print_snapshots(&snapshots, false)?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed change notifications");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                return Ok(());
            }
        }
    }
}

fn print_snapshots(snapshots: &[ExtensionSnapshot], json: bool) -> Result<()> {
    if json {
        let output =
            serde_json::to_string_pretty(snapshots).context("Failed to serialize snapshots")?;
        println!("{output}");
        return Ok(());
    }

    if snapshots.is_empty() {
        println!("No extensions found.");
        return Ok(());
    }

    for snapshot in snapshots {
        println!(
            "{:<24} {:<12} {:<8} {}",
            snapshot.id,
            snapshot.version,
            if snapshot.is_enabled { "enabled" } else { "disabled" },
            snapshot.status_message
        );
    }

    Ok(())
}
