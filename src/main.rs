//! CLI entry point for the p2p chat node.
//!
//! This binary provides a command-line interface for the chat library:
//! running a node in rendezvous or direct-connect mode, and managing the node
//! identity and configuration file.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use p2p_chat::{
    crypto::NodeIdentity,
    network::PeerAddress,
    utils::{NodeConfig, DEFAULT_CONFIG_FILE},
    App,
};
use std::path::PathBuf;
use tokio::signal;

/// P2P Chat - rendezvous-based peer-to-peer chat over libp2p
#[derive(Parser)]
#[command(name = "p2p-chat")]
#[command(about = "Find peers under a shared rendezvous topic and chat with them")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Node key file; created on first use
    #[arg(short, long, value_name = "FILE", global = true)]
    key_file: Option<PathBuf>,

    /// Run with a fresh identity, ignoring the default key file
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the rendezvous topic and chat with every peer found (default)
    Run(RunArgs),
    /// Connect directly to a peer address
    Connect {
        /// Full peer address, e.g. /ip4/1.2.3.4/tcp/4001/p2p/<peer-id>
        address: String,
        /// Number of liveness probes before chatting
        #[arg(long, value_name = "N")]
        pings: Option<usize>,
        /// Only probe the peer, do not open a chat session
        #[arg(long)]
        ping_only: bool,
    },
    /// Manage the node identity
    Identity {
        #[command(subcommand)]
        action: IdentityCommands,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(clap::Args, Default)]
struct RunArgs {
    /// Listen address (can be used multiple times)
    #[arg(short, long, value_name = "ADDR")]
    listen: Vec<String>,
    /// Bootstrap peer address (can be used multiple times)
    #[arg(short, long, value_name = "ADDR")]
    bootstrap: Vec<String>,
    /// Rendezvous topic
    #[arg(short, long)]
    topic: Option<String>,
    /// Disable DHT discovery
    #[arg(long)]
    no_dht: bool,
    /// Disable mDNS discovery
    #[arg(long)]
    no_mdns: bool,
}

#[derive(Subcommand)]
enum IdentityCommands {
    /// Generate a new node key
    Generate {
        /// Output file
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
        /// Overwrite an existing key
        #[arg(short, long)]
        force: bool,
    },
    /// Show the node identity
    Show {
        /// Output format (hex, json)
        #[arg(short, long, default_value = "hex")]
        format: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Validate a configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = NodeConfig::load(cli.config.as_deref())?;
    if let Some(key_file) = cli.key_file {
        config.identity.key_file = Some(key_file);
    }
    if cli.ephemeral {
        config.identity.ephemeral = true;
    }

    // Initialize logging
    setup_logging(cli.verbose, cli.quiet, &config.logging.level)?;

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => handle_run_command(args, config).await,
        Commands::Connect {
            address,
            pings,
            ping_only,
        } => handle_connect_command(address, pings, ping_only, config).await,
        Commands::Identity { action } => handle_identity_commands(action, &config),
        Commands::Config { action } => handle_config_commands(action, &config),
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) -> Result<()> {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .target(env_logger::Target::Stderr)
        .init();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    println!("\nReceived signal, shutting down...");
}

async fn handle_run_command(args: RunArgs, mut config: NodeConfig) -> Result<()> {
    if !args.listen.is_empty() {
        config.network.listen_addresses = args.listen;
    }
    if !args.bootstrap.is_empty() {
        config.discovery.bootstrap_nodes = args.bootstrap;
    }
    if let Some(topic) = args.topic {
        config.discovery.topic = topic;
    }
    if args.no_dht {
        config.discovery.enable_dht = false;
    }
    if args.no_mdns {
        config.discovery.enable_mdns = false;
    }

    info!("Rendezvous topic: {}", config.discovery.topic);
    let mut app = App::new(config).await?;
    app.start_console();
    app.run(shutdown_signal()).await?;

    info!("Node stopped");
    Ok(())
}

async fn handle_connect_command(
    address: String,
    pings: Option<usize>,
    ping_only: bool,
    mut config: NodeConfig,
) -> Result<()> {
    let target = PeerAddress::parse(&address)?;
    if let Some(pings) = pings {
        config.chat.ping_count = pings;
    }
    // Direct mode needs no discovery.
    config.discovery.enable_dht = false;
    config.discovery.enable_mdns = false;

    let mut app = App::new(config).await?;
    if !ping_only {
        app.start_console();
    }
    app.run_direct(target, ping_only, shutdown_signal()).await?;
    Ok(())
}

fn key_path(config: &NodeConfig) -> Result<PathBuf> {
    config
        .identity
        .key_path()
        .context("No data directory on this platform, pass --key-file")
}

fn handle_identity_commands(action: IdentityCommands, config: &NodeConfig) -> Result<()> {
    match action {
        IdentityCommands::Generate { output, force } => {
            let path = match output {
                Some(path) => path,
                None => key_path(config)?,
            };

            if path.exists() && !force {
                bail!(
                    "Key file {} already exists, use --force to overwrite",
                    path.display()
                );
            }

            let identity = NodeIdentity::generate();
            identity.save(&path)?;
            println!("✓ Node key generated: {}", path.display());
            println!("Peer ID: {}", identity.peer_id());
        }
        IdentityCommands::Show { format } => {
            let path = key_path(config)?;
            let identity = NodeIdentity::load(&path)?;

            match format.as_str() {
                "json" => {
                    let info = serde_json::json!({
                        "peer_id": identity.peer_id().to_string(),
                        "public_key": identity.public_key_hex(),
                        "key_file": path.display().to_string(),
                    });
                    println!("{}", serde_json::to_string_pretty(&info)?);
                }
                "hex" => {
                    println!("Node Identity");
                    println!("=============");
                    println!("Peer ID: {}", identity.peer_id());
                    println!("Public Key: {}", identity.public_key_hex());
                    println!("Key File: {}", path.display());
                }
                other => bail!("Unknown format '{}', expected hex or json", other),
            }
        }
    }
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &NodeConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            NodeConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = match file {
                Some(path) => NodeConfig::from_file(path)?,
                None => config.clone(),
            };
            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show => {
            println!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}
