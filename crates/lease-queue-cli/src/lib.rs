//! # Lease Queue CLI
//!
//! Command-line front end for lease-queue.
//!
//! This module provides commands to:
//! - Create and delete queues
//! - Push JSON messages
//! - Pop a message, print it, and commit or release it
//!
//! Configuration sources, later ones overriding earlier ones:
//! 1. `config/lease-queue.{yaml,toml,json}` when present
//! 2. The file given with `--config` (must exist)
//! 3. `LEASE_QUEUE__*` environment variables, e.g.
//!    `LEASE_QUEUE__LEASE__VISIBILITY_TIMEOUT_SECS=60`
//! 4. `--queue-url`

use clap::{Parser, Subcommand};
use lease_queue::{
    completion, ClientConfig, LeaseState, QueueAttributes, QueueClient, QueueError, QueueName,
    QueueTransport,
};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Filter used when neither `--log-level` nor `RUST_LOG` is given
pub const DEFAULT_LOG_FILTER: &str = "lease_queue=info,lease_queue_cli=info";

const ENV_PREFIX: &str = "LEASE_QUEUE";

// ============================================================================
// CLI Structure
// ============================================================================

/// Lease Queue CLI - push and pop against a visibility-timeout queue
#[derive(Parser)]
#[command(name = "lease-queue")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Push and pop messages with automatic lease renewal")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "LEASE_QUEUE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Queue URL, overriding any configured value
    #[arg(short, long)]
    pub queue_url: Option<String>,

    /// Logging level for the lease-queue crates, overriding RUST_LOG
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create a queue and print its URL
    Create {
        /// Queue name
        name: String,

        /// Queue attribute as NAME=VALUE, may be repeated
        #[arg(short, long = "attribute", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,
    },

    /// Delete the configured queue
    Delete,

    /// Push one message
    Push {
        /// JSON message body
        message: String,

        /// Send the argument as a JSON string instead of parsing it
        #[arg(long)]
        text: bool,
    },

    /// Pop one message and print its body
    Pop {
        /// Give up after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Release the message for redelivery instead of deleting it
        #[arg(long)]
        release: bool,
    },
}

fn parse_attribute(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, attribute)) if !name.is_empty() => {
            Ok((name.to_string(), attribute.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{}'", value)),
    }
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Logging setup failed: {message}")]
    Logging { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Queue(QueueError::Configuration(_)) => 1,
            Self::Queue(QueueError::DeadlineElapsed { .. }) => 3,
            Self::Queue(_) => 2,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
            Self::Logging { .. } => 6,
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    let config = load_configuration(&cli)?;
    let client = QueueClient::new(config)?;

    let stdout = std::io::stdout();
    execute_command(cli.command, &client, &mut stdout.lock()).await
}

/// Initialize logging based on CLI arguments
pub fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = log_filter(cli.log_level.as_deref())?;
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so stdout only carries command output
    let result = if cli.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| CliError::Logging {
        message: e.to_string(),
    })
}

fn log_filter(level: Option<&str>) -> Result<EnvFilter, CliError> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(format!("lease_queue={level},lease_queue_cli={level}")),
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER)),
    };

    filter.map_err(|e| CliError::InvalidArgument {
        arg: "log-level".to_string(),
        message: e.to_string(),
    })
}

/// Load client configuration from files, environment and arguments
pub fn load_configuration(cli: &Cli) -> Result<ClientConfig, CliError> {
    build_configuration(cli, config::Environment::with_prefix(ENV_PREFIX))
}

fn build_configuration(
    cli: &Cli,
    environment: config::Environment,
) -> Result<ClientConfig, CliError> {
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name("config/lease-queue").required(false));

    if let Some(path) = &cli.config {
        info!(path = %path.display(), "Loading configuration from explicit path");
        builder = builder.add_source(config::File::from(path.as_path()).required(true));
    }

    let mut client_config: ClientConfig = builder
        .add_source(environment.separator("__").try_parsing(true))
        .build()?
        .try_deserialize()?;

    if let Some(queue_url) = &cli.queue_url {
        client_config.queue_url = Some(queue_url.clone());
    }

    debug!(config = ?client_config, "Configuration loaded");
    Ok(client_config)
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Run one command against `client`, writing results to `out`
pub async fn execute_command<T, W>(
    command: Commands,
    client: &QueueClient<T>,
    out: &mut W,
) -> Result<(), CliError>
where
    T: QueueTransport,
    W: Write,
{
    match command {
        Commands::Create { name, attributes } => {
            execute_create_command(client, name, attributes, out).await
        }
        Commands::Delete => execute_delete_command(client).await,
        Commands::Push { message, text } => execute_push_command(client, message, text, out).await,
        Commands::Pop { timeout, release } => {
            execute_pop_command(client, timeout, release, out).await
        }
    }
}

async fn execute_create_command<T: QueueTransport, W: Write>(
    client: &QueueClient<T>,
    name: String,
    attributes: Vec<(String, String)>,
    out: &mut W,
) -> Result<(), CliError> {
    let name = QueueName::new(name)?;
    let attributes: QueueAttributes = attributes.into_iter().collect();

    let queue_url = client.create_queue(&name, &attributes).await?;
    info!(queue = %name, queue_url = %queue_url, "Queue created");

    writeln!(out, "{}", queue_url)?;
    Ok(())
}

async fn execute_delete_command<T: QueueTransport>(
    client: &QueueClient<T>,
) -> Result<(), CliError> {
    client.delete_queue(None).await?;
    info!("Queue deleted");
    Ok(())
}

async fn execute_push_command<T: QueueTransport, W: Write>(
    client: &QueueClient<T>,
    message: String,
    text: bool,
    out: &mut W,
) -> Result<(), CliError> {
    let body = if text {
        Value::String(message)
    } else {
        serde_json::from_str(&message).map_err(|e| CliError::InvalidArgument {
            arg: "message".to_string(),
            message: format!("not valid JSON ({}); use --text to send it as a string", e),
        })?
    };

    let receipt = client.push(&body).await?;
    if let Some(message_id) = &receipt.message_id {
        writeln!(out, "{}", message_id)?;
    }
    Ok(())
}

async fn execute_pop_command<T: QueueTransport, W: Write>(
    client: &QueueClient<T>,
    timeout: Option<u64>,
    release: bool,
    out: &mut W,
) -> Result<(), CliError> {
    let (done, task) = completion();
    let pop = client.pop_with_lease::<Value, _, _>(task);

    let (body, lease) = match timeout {
        Some(secs) => {
            let timeout = Duration::from_secs(secs);
            tokio::time::timeout(timeout, pop)
                .await
                .map_err(|_| QueueError::DeadlineElapsed { timeout })??
        }
        None => pop.await?,
    };

    let written = writeln!(out, "{}", body);

    // A message that could not be printed must not be lost
    if release || written.is_err() {
        done.fail("released from the command line");
    } else {
        done.succeed();
    }

    let state = lease.settled().await?;
    if state == LeaseState::Released {
        info!("Message released for redelivery");
    }

    written?;
    Ok(())
}
