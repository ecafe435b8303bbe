//! # scan_server
//!
//! Runs scans from JSON command files against simulated devices.
//!
//! ```text
//! scan_server run scan.json --config server.toml
//! scan_server check scan.json
//! scan_server devices --config server.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use scan_server::device::{DeviceProvider, DeviceRegistry};
use scan_server::engine::ScanCompiler;
use scan_server::scripting::RhaiScriptLoader;
use scan_server::{load_commands, logging, ScanCommand, ScanServer, ScanState, ServerConfig};
use serde_json::json;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Scan command execution server
#[derive(Parser, Debug)]
#[command(name = "scan_server")]
#[command(version)]
#[command(about = "Compile and run device scans")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scan and print its final status and data as JSON
    Run {
        /// JSON command list
        commands: PathBuf,

        /// Scan name, defaults to the file name
        #[arg(long)]
        name: Option<String>,

        /// Register the scan without starting it
        #[arg(long)]
        queue_only: bool,

        /// Progress report interval in milliseconds
        #[arg(long, default_value_t = 500)]
        progress_ms: u64,
    },
    /// Compile a command list and print the command tree with work units
    Check {
        /// JSON command list
        commands: PathBuf,
    },
    /// List the configured devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    logging::init(&config.logging);

    match cli.command {
        Command::Run {
            commands,
            name,
            queue_only,
            progress_ms,
        } => {
            let name = name.unwrap_or_else(|| scan_name(&commands));
            run(&config, &commands, name, queue_only, progress_ms).await
        }
        Command::Check { commands } => check(&config, &commands),
        Command::Devices => {
            let (registry, _) = DeviceRegistry::simulated(&config.devices);
            for name in registry.device_names() {
                let device = registry.resolve(&name)?;
                println!("{}\t{}", name, device.read().await?);
            }
            Ok(())
        }
    }
}

async fn run(
    config: &ServerConfig,
    path: &Path,
    name: String,
    queue_only: bool,
    progress_ms: u64,
) -> Result<()> {
    let commands = read_commands(path)?;
    let (registry, journal) = DeviceRegistry::simulated(&config.devices);
    let server = Arc::new(ScanServer::from_config(config, Arc::new(registry)));

    info!(server = %config.server.name, scan = %name, "Submitting scan");
    let id = server.submit(name, commands, queue_only).await?;
    if queue_only {
        println!("{}", serde_json::to_string_pretty(&server.scan_info(id).await?)?);
        return Ok(());
    }

    let ctrl_c = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling scan");
                server.cancel_all().await;
            }
        })
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(progress_ms.max(10)));
    let info = loop {
        tokio::select! {
            info = server.wait_until_done(id) => break info?,
            _ = ticker.tick() => {
                let info = server.scan_info(id).await?;
                info!(
                    percent = info.percentage(),
                    current = info.current_command.as_deref().unwrap_or(""),
                    "Progress"
                );
            }
        }
    };
    ctrl_c.abort();

    let report = json!({
        "scan": info,
        "data": server.scan_data(id).await?,
        "writes": journal.entries(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if info.state == ScanState::Failed {
        bail!(
            "Scan failed: {}",
            info.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}

fn check(config: &ServerConfig, path: &Path) -> Result<()> {
    let commands = read_commands(path)?;
    let loader = RhaiScriptLoader::new(
        config.scripting.script_paths.clone(),
        config.scripting.max_operations,
    );
    let root = ScanCompiler::new()
        .with_script_loader(Arc::new(loader))
        .compile(&commands)?;
    print!("{}", root.tree());
    println!("Total: {} work units", root.work_units());
    Ok(())
}

fn read_commands(path: &Path) -> Result<Vec<ScanCommand>> {
    load_commands(path).with_context(|| format!("Invalid command file {}", path.display()))
}

fn scan_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "scan".to_string())
}
