//! Netvor CLI
//!
//! Imports share-links, manages stored profiles and runs a tunnel session
//! in the foreground.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use netvor_core::{
    LinuxTunProvider, ProfileStore, SessionOrchestrator, SessionParts, Settings, StartOutcome,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Netvor - VLESS share-link tunnel
#[derive(Parser)]
#[command(name = "netvor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to settings file (defaults are used if it does not exist)
    #[arg(short, long, default_value = "netvor.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a vless:// share-link and make it active
    Import {
        link: String,
    },

    /// List stored configs; the active one is starred
    List,

    /// Make a stored config active
    Activate {
        name: String,
    },

    /// Delete a stored config
    Delete {
        name: String,
    },

    /// Print a compiled engine document (the active one by default)
    Show {
        name: Option<String>,
    },

    /// Run the tunnel until interrupted
    Connect,

    /// Generate a sample settings file
    GenConfig {
        /// Output path for the settings file
        #[arg(short, long, default_value = "netvor.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    if let Commands::GenConfig { output } = &cli.command {
        return generate_config(output);
    }

    let settings = load_settings(&cli.config)?;
    let store = ProfileStore::open(&settings.data_dir)
        .with_context(|| format!("Failed to open profile store at {:?}", settings.data_dir))?;

    match cli.command {
        Commands::Import { link } => import(&store, &link),
        Commands::List => list(&store),
        Commands::Activate { name } => {
            store
                .activate_config(&name)
                .with_context(|| format!("Failed to activate '{}'", name))?;
            println!("Active: {}", name);
            Ok(())
        }
        Commands::Delete { name } => {
            store
                .delete_config(&name)
                .with_context(|| format!("Failed to delete '{}'", name))?;
            println!("Deleted: {}", name);
            Ok(())
        }
        Commands::Show { name } => show(&store, name),
        Commands::Connect => connect(settings, store).await,
        Commands::GenConfig { .. } => Ok(()),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .init();
}

fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        info!("No settings file at {:?}, using defaults", path);
        return Ok(Settings::default());
    }

    let settings = Settings::from_toml_file(path)
        .with_context(|| format!("Failed to load settings from {:?}", path))?;
    info!("Settings loaded from {:?}", path);
    Ok(settings)
}

fn generate_config(output: &Path) -> Result<()> {
    let sample = Settings::default()
        .to_toml()
        .context("Failed to render sample settings")?;

    std::fs::write(output, sample)
        .with_context(|| format!("Failed to write settings to {:?}", output))?;

    println!("Sample settings written to {:?}", output);
    Ok(())
}

fn import(store: &ProfileStore, link: &str) -> Result<()> {
    let name = store.save_link(link).context("Failed to import share-link")?;
    println!("Imported and activated: {}", name);
    Ok(())
}

fn list(store: &ProfileStore) -> Result<()> {
    let active = store.active_config_name()?;
    let names = store.list_configs()?;

    if names.is_empty() {
        println!("No configs stored. Import one with `netvor import <link>`.");
        return Ok(());
    }

    for name in names {
        let marker = if active.as_deref() == Some(name.as_str()) {
            "*"
        } else {
            " "
        };
        println!("{} {}", marker, name);
    }
    Ok(())
}

fn show(store: &ProfileStore, name: Option<String>) -> Result<()> {
    let name = match name {
        Some(name) => name,
        None => store
            .active_config_name()?
            .context("No active config")?,
    };

    let config = store
        .load_config(&name)
        .with_context(|| format!("Failed to load '{}'", name))?;
    println!("{}", config.to_json()?);
    Ok(())
}

async fn connect(settings: Settings, store: ProfileStore) -> Result<()> {
    let parts = SessionParts::local(&settings, Arc::new(store), Arc::new(LinuxTunProvider::new()));
    let session = SessionOrchestrator::new(
        parts,
        settings.interface.clone(),
        settings.stats.interval(),
    );

    // Mirror engine output and status into the log
    let mut logs = session.bus().subscribe_logs();
    let log_task = tokio::spawn(async move {
        while let Some(line) = logs.recv().await {
            info!("{}", line);
        }
    });

    let mut status = session.bus().subscribe_status();
    let status_task = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            if current.connected {
                info!(
                    "Connected | rx {} B | tx {} B",
                    current.rx_bytes, current.tx_bytes
                );
            } else {
                info!("Disconnected");
            }
        }
    });

    let outcome = match session.start().await {
        Ok(outcome) => outcome,
        Err(e) if e.is_user_error() => {
            anyhow::bail!("{} (run `netvor import` or `netvor activate` first)", e)
        }
        Err(e) => return Err(e).context("Failed to start session"),
    };
    match outcome {
        StartOutcome::Started => info!("Tunnel up, press Ctrl+C to disconnect"),
        StartOutcome::AlreadyRunning => warn!("Session already running"),
    }

    wait_for_shutdown().await?;

    info!("Shutting down...");
    session.shutdown().await;

    log_task.abort();
    status_task.abort();
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
