//! espapi
//!
//! Command-line client for ESPHome native API devices.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use client::{
    default_config_path, Client, ClientEvent, ClientOptions, Config, ConnectionError,
    LogSubscription,
};
use tokio::sync::broadcast;

/// Time allowed for connecting, authorizing and initializing.
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);

/// espapi - talk to ESPHome devices over the native API.
#[derive(Parser, Debug)]
#[command(name = "espapi")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Device host name or address
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Device API port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// API password
    #[arg(long, global = true)]
    pub password: Option<String>,

    /// Base64 pre-shared encryption key
    #[arg(long, global = true, value_name = "KEY")]
    pub key: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Print device information
    Info,

    /// List the device's entities
    Entities,

    /// Stream device logs until interrupted
    Logs {
        /// Minimum log level (error, warn, info, config, debug, verbose)
        #[arg(long, short, default_value = "debug")]
        level: String,

        /// Ask the device to dump its configuration first
        #[arg(long)]
        dump_config: bool,
    },

    /// Stream entity state updates until interrupted
    States,

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    match &cli.command {
        Commands::Config(command) => run_config_command(command, &cli, &config_path),
        command => {
            let config = load_config(&cli, &config_path)?;
            config.validate()?;
            run_device_command(command.clone(), config).await
        }
    }
}

async fn run_device_command(command: Commands, config: Config) -> anyhow::Result<()> {
    match command {
        Commands::Info => {
            let options = ClientOptions {
                initialize_list_entities: false,
                initialize_subscribe_states: false,
                ..Default::default()
            };
            let client = start(config, options, false).await?;
            if let Some(info) = client.device_info() {
                println!("Name:        {}", info.name);
                if !info.friendly_name.is_empty() {
                    println!("Friendly:    {}", info.friendly_name);
                }
                println!("Model:       {}", info.model);
                println!("MAC:         {}", info.mac_address);
                println!("ESPHome:     {}", info.esphome_version);
                println!("Compiled:    {}", info.compilation_time);
                if !info.project_name.is_empty() {
                    println!("Project:     {} {}", info.project_name, info.project_version);
                }
            }
            if let Some((major, minor)) = client.connection().api_version() {
                println!("API version: {}.{}", major, minor);
            }
            client.disconnect();
        }
        Commands::Entities => {
            let options = ClientOptions {
                initialize_subscribe_states: false,
                ..Default::default()
            };
            let client = start(config, options, false).await?;
            let entities = client.entities();
            if entities.is_empty() {
                println!("No entities");
            }
            for entity in entities {
                println!(
                    "{:<20} {:>10}  {:<24} {}",
                    entity.component(),
                    entity.info.key,
                    entity.info.object_id,
                    entity.info.name
                );
            }
            client.disconnect();
        }
        Commands::Logs { level, dump_config } => {
            let subscription = LogSubscription { level, dump_config };
            if subscription.log_level().is_none() {
                anyhow::bail!("Unknown log level: {}", subscription.level);
            }
            let options = ClientOptions {
                initialize_device_info: false,
                initialize_list_entities: false,
                initialize_subscribe_states: false,
                initialize_subscribe_logs: Some(subscription),
                ..Default::default()
            };
            let client = start(config, options, true).await?;
            stream_until_interrupted(&client, |event| {
                if let ClientEvent::Logs(logs) = event {
                    println!("{}", String::from_utf8_lossy(&logs.message).trim_end());
                }
            })
            .await;
            client.disconnect();
        }
        Commands::States => {
            let client = start(config, ClientOptions::default(), true).await?;
            stream_until_interrupted(&client, |event| {
                if let ClientEvent::State { kind, state } = event {
                    let name = client
                        .entity(state.key)
                        .map(|entity| entity.info.object_id)
                        .unwrap_or_else(|| format!("{:#010x}", state.key));
                    println!("{:<20} {} ({} bytes)", kind, name, state.raw.len());
                }
            })
            .await;
            client.disconnect();
        }
        Commands::Config(_) => anyhow::bail!("Not a device command"),
    }

    Ok(())
}

fn load_config(cli: &Cli, path: &Path) -> anyhow::Result<Config> {
    let mut config = Config::load(path)?;

    // Apply environment variable overrides, then command-line flags
    config.apply_env_overrides();
    if let Some(host) = &cli.host {
        config.connection.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.connection.port = port;
    }
    if let Some(password) = &cli.password {
        config.connection.password = password.clone();
    }
    if let Some(key) = &cli.key {
        config.connection.encryption_key = Some(key.clone());
    }

    Ok(config)
}

fn run_config_command(command: &ConfigCommands, cli: &Cli, path: &Path) -> anyhow::Result<()> {
    match command {
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(path)?;
            println!("Wrote {}", path.display());
        }
        ConfigCommands::Show => {
            let config = load_config(cli, path)?;
            print!("{}", config.to_toml()?);
        }
    }
    Ok(())
}

/// Connects and waits for the client to finish initializing.
async fn start(mut config: Config, options: ClientOptions, reconnect: bool) -> anyhow::Result<Client> {
    config.connection.reconnect = reconnect;
    let host = config.connection.host.clone();

    let client = Client::new(config.connection, options)?;
    let mut events = client.subscribe();
    client.connect()?;

    tokio::time::timeout(INITIALIZE_TIMEOUT, wait_initialized(&mut events))
        .await
        .with_context(|| format!("Timed out connecting to {}", host))?
        .with_context(|| format!("Failed to connect to {}", host))?;

    Ok(client)
}

async fn wait_initialized(events: &mut broadcast::Receiver<ClientEvent>) -> anyhow::Result<()> {
    loop {
        match events.recv().await {
            Ok(ClientEvent::Initialized) => return Ok(()),
            Ok(ClientEvent::Error(error)) if ends_session(&error) => {
                return Err(anyhow::anyhow!("{}", error));
            }
            Ok(ClientEvent::Error(error)) => {
                tracing::warn!(error = %error, "Device error");
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                anyhow::bail!("Client stopped before initializing");
            }
        }
    }
}

/// Whether an error reported during startup means the attempt failed.
fn ends_session(error: &ConnectionError) -> bool {
    match error {
        ConnectionError::Transport(transport) => transport.is_fatal(),
        ConnectionError::AutoReply { .. } => false,
        ConnectionError::Protocol(protocol) => protocol.is_fatal_decode(),
        _ => true,
    }
}

async fn stream_until_interrupted<F>(client: &Client, mut on_event: F)
where
    F: FnMut(ClientEvent),
{
    let mut events = client.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ClientEvent::Disconnected) => {
                    tracing::warn!("Device disconnected, waiting for reconnect");
                }
                Ok(ClientEvent::Error(error)) => {
                    tracing::warn!(error = %error, "Device error");
                }
                Ok(event) => on_event(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::debug!("Interrupted");
                break;
            }
        }
    }
}
