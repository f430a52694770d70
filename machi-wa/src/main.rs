//! Machi WA CLI - multi-session messaging gateway
//!
//! A command-line interface for running the gateway and inspecting its
//! configuration and stored sessions.

#![allow(clippy::print_stdout)] // CLI program intentionally uses stdout

use clap::{Args, Parser, Subcommand};
use machi_wa::config::{
    GatewayConfig, IssueLevel, config_path, init_config, load_config, load_config_from,
};
use machi_wa::error::{GatewayError, Result};
use machi_wa::gateway::GatewayBuilder;
use machi_wa::session::CredentialStore;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Machi WA - multi-session messaging gateway
#[derive(Parser)]
#[command(name = "machi-wa")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, env = "MACHI_WA_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides config)
    #[arg(long, env = "MACHI_WA_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve(ServeArgs),

    /// List sessions with stored credentials
    Sessions,

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the serve command
#[derive(Args)]
struct ServeArgs {
    /// Bind address (overrides config)
    #[arg(long, env = "MACHI_WA_HOST")]
    host: Option<String>,

    /// Bind port (overrides config)
    #[arg(short, long, env = "MACHI_WA_PORT")]
    port: Option<u16>,

    /// Do not resume sessions found on disk
    #[arg(long)]
    no_restore: bool,

    /// Forward lifecycle events to this URL (overrides config)
    #[arg(long)]
    webhook: Option<String>,
}

/// Arguments for the config command
#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default configuration file
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
    /// Validate configuration
    Validate,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbose);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging with the given verbosity level.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "machi_wa={level},{}",
            if verbosity >= 2 { "debug" } else { "warn" }
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity >= 2)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve(ref args) => cmd_serve(args, &cli).await,
        Commands::Sessions => cmd_sessions(&cli).await,
        Commands::Config(ref args) => cmd_config(args, &cli).await,
    }
}

/// Config file selected by `--config`, or the default.
fn selected_config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(config_path)
}

/// Load configuration and apply global overrides.
async fn load(cli: &Cli) -> Result<GatewayConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config_from(path).await?,
        None => load_config().await?,
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir.clone_from(dir);
    }
    Ok(config)
}

/// Start the gateway.
async fn cmd_serve(args: &ServeArgs, cli: &Cli) -> Result<()> {
    let mut config = load(cli).await?;

    if let Some(host) = &args.host {
        config.server.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.no_restore {
        config.restore_sessions = false;
    }
    if let Some(url) = &args.webhook {
        config.webhook.url = Some(url.clone());
    }

    for issue in config.validate() {
        if issue.level == IssueLevel::Warning {
            tracing::warn!("{issue}");
        }
    }

    tracing::info!(
        addr = %config.server.addr(),
        data_dir = %config.data_dir.display(),
        "Starting Machi WA gateway..."
    );

    let gateway = GatewayBuilder::new().config(config).build()?;
    gateway.run().await
}

/// List stored sessions.
async fn cmd_sessions(cli: &Cli) -> Result<()> {
    let config = load(cli).await?;
    let store = CredentialStore::new(config.sessions_dir());
    let tokens = store.list_tokens().await?;

    if tokens.is_empty() {
        println!("No stored sessions in {}", store.root().display());
        return Ok(());
    }

    println!("Stored sessions ({}):", store.root().display());
    for token in tokens {
        println!("  {token}");
    }
    Ok(())
}

/// Configuration management.
async fn cmd_config(args: &ConfigArgs, cli: &Cli) -> Result<()> {
    let config_file = selected_config_path(cli);

    match args.command {
        ConfigCommands::Init { force } => {
            if config_file.exists() && !force {
                println!("Configuration already exists at: {}", config_file.display());
                println!("Use --force to overwrite.");
                return Ok(());
            }

            let written = if cli.config.is_some() {
                machi_wa::config::save_config(&GatewayConfig::default(), &config_file).await?;
                config_file
            } else {
                init_config().await?
            };

            println!("Configuration created: {}", written.display());
            println!();
            println!("Next steps:");
            println!("  1. set bridge.command / bridge.args to your client bridge");
            println!("  2. machi-wa serve");
        }
        ConfigCommands::Path => {
            println!("{}", config_file.display());
        }
        ConfigCommands::Show => {
            let config = load(cli).await?;
            let content = serde_json::to_string_pretty(&config)?;
            println!("{content}");
        }
        ConfigCommands::Validate => {
            let config = load(cli).await?;
            let issues = config.validate();
            if issues.is_empty() {
                println!("Configuration is valid");
                return Ok(());
            }

            for issue in &issues {
                println!("{issue}");
            }
            if config.has_errors() {
                return Err(GatewayError::config("configuration has errors"));
            }
        }
    }

    Ok(())
}
