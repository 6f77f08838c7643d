//! # Taskqueue CLI
//!
//! Command-line interface for adding, consuming and inspecting queued
//! messages.
//!
//! This module provides CLI commands for:
//! - Adding messages to a queue
//! - Consuming messages and printing them as JSON lines
//! - Queue statistics and dead-letter redrive
//! - Showing the resolved configuration
//! - Shell completion generation

use clap::{CommandFactory, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskqueue_runtime::{
    ConfigurationError, Connection, ConnectionConfig, ConsumeOptions, ConsumerHandle, ConsumerState,
    FilesystemConfig, InMemoryConfig, Message, MessageProcessor, ProviderConfig, Queue,
    QueueError, QueueName, RedeliveryPolicy, ValidationError,
};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// CLI Structure
// ============================================================================

/// Taskqueue CLI - durable at-least-once work queues
#[derive(Parser)]
#[command(name = "taskqueue")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Add, consume and inspect queued messages")]
#[command(
    long_about = "Taskqueue stores named messages in a durable queue and hands them to consumers with at-least-once delivery"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "TASKQUEUE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Logging level (overrides the configured level)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Queue to operate on (overrides the configured queue)
    #[arg(short, long, global = true)]
    pub queue: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Add a message to the queue
    Add {
        /// Logical message name
        #[arg(short, long)]
        name: String,

        /// Message payload; read from stdin when omitted
        #[arg(short, long)]
        payload: Option<String>,
    },

    /// Consume messages, printing each as a JSON line
    Consume {
        /// Maximum deliveries processed concurrently
        #[arg(short, long)]
        batch_size: Option<u32>,

        /// Milliseconds between polls
        #[arg(long)]
        poll_interval_ms: Option<u64>,

        /// Stop after this many messages were processed
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        limit: Option<u64>,
    },

    /// Show queue statistics
    Stats {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Move dead-lettered messages back to the queue
    Redrive,

    /// Show the resolved configuration
    Config {
        /// Output format for configuration
        #[arg(short, long, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Output format options
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
    /// YAML output
    Yaml,
}

/// Configuration format options
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// JSON format
    Json,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Queue(_) => 2,
            Self::CommandFailed { .. } => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
        }
    }

    fn invalid_argument(arg: &str, error: ValidationError) -> Self {
        Self::InvalidArgument {
            arg: arg.to_string(),
            message: error.to_string(),
        }
    }

    fn output(error: impl std::fmt::Display) -> Self {
        Self::CommandFailed {
            message: format!("Failed to render output: {}", error),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid store configuration: {0}")]
    Store(#[from] ConfigurationError),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

// ============================================================================
// Configuration Types
// ============================================================================

/// CLI configuration structure
///
/// Every field has a default, so an empty file or environment yields a
/// usable configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CliConfig {
    /// Queue used when `--queue` is not given
    pub queue: String,

    /// Backing store settings
    pub store: StoreConfig,

    /// Consumer defaults
    pub consumer: ConsumerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            queue: "tasks".to_string(),
            store: StoreConfig::default(),
            consumer: ConsumerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CliConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        QueueName::new(self.queue.clone()).map_err(|e| ConfigError::InvalidValue {
            key: "queue".to_string(),
            message: e.to_string(),
        })?;
        self.store.to_connection_config().validate()?;
        self.consumer.to_options(None, None).map_err(|e| ConfigError::InvalidValue {
            key: "consumer".to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }
}

/// Kind of backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Process-local store; contents are lost on exit
    Memory,
    /// Durable store below `data_dir`
    Filesystem,
}

/// Backing store configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub data_dir: PathBuf,
    /// Only used by the memory store
    pub max_queue_size: usize,
    pub redelivery: RedeliveryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let filesystem = FilesystemConfig::default();
        Self {
            kind: StoreKind::Filesystem,
            data_dir: filesystem.data_dir,
            max_queue_size: InMemoryConfig::default().max_queue_size,
            redelivery: RedeliveryPolicy::default(),
        }
    }
}

impl StoreConfig {
    /// Connection settings for the runtime
    pub fn to_connection_config(&self) -> ConnectionConfig {
        let provider = match self.kind {
            StoreKind::Memory => ProviderConfig::InMemory(InMemoryConfig {
                max_queue_size: self.max_queue_size,
                redelivery: self.redelivery.clone(),
            }),
            StoreKind::Filesystem => ProviderConfig::Filesystem(FilesystemConfig {
                data_dir: self.data_dir.clone(),
                redelivery: self.redelivery.clone(),
            }),
        };
        ConnectionConfig { provider }
    }
}

/// Consumer defaults
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub batch_size: u32,
    pub poll_interval_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval_ms: 100,
        }
    }
}

impl ConsumerConfig {
    /// Build consume options, letting command-line values win
    pub fn to_options(
        &self,
        batch_size: Option<u32>,
        poll_interval_ms: Option<u64>,
    ) -> Result<ConsumeOptions, ValidationError> {
        ConsumeOptions::new(
            batch_size.unwrap_or(self.batch_size),
            Duration::from_millis(poll_interval_ms.unwrap_or(self.poll_interval_ms)),
        )
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum LogFormat {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "json")]
    Json,
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    run(Cli::parse()).await
}

/// Execute a parsed command line
pub async fn run(cli: Cli) -> Result<(), CliError> {
    // Completions need neither configuration nor logging
    if let Commands::Completions { shell } = &cli.command {
        return execute_completions_command(*shell);
    }

    let mut config = load_configuration(cli.config.as_ref())?;
    if let Some(queue) = &cli.queue {
        config.queue = queue.clone();
    }

    initialize_logging(&cli, &config);

    match cli.command {
        Commands::Add { name, payload } => execute_add_command(&config, name, payload).await,
        Commands::Consume {
            batch_size,
            poll_interval_ms,
            limit,
        } => execute_consume_command(&config, batch_size, poll_interval_ms, limit).await,
        Commands::Stats { format } => execute_stats_command(&config, format).await,
        Commands::Redrive => execute_redrive_command(&config).await,
        Commands::Config { format } => execute_config_command(&config, format),
        Commands::Completions { shell } => execute_completions_command(shell),
    }
}

// ============================================================================
// Setup
// ============================================================================

/// Initialize logging based on CLI arguments and configuration
///
/// `RUST_LOG` wins over `--log-level`, which wins over the configured level.
/// Logs go to stderr so stdout stays machine-readable.
fn initialize_logging(cli: &Cli, config: &CliConfig) {
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let json = cli.json_logs || config.logging.format == LogFormat::Json;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
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

    if let Err(e) = result {
        eprintln!("Logging already initialized: {}", e);
    }
}

/// Load configuration from defaults, an optional file and the environment
///
/// Sources, later ones overriding earlier ones:
///  1. Built-in defaults
///  2. The file given by `--config` / `TASKQUEUE_CONFIG` (format by extension)
///  3. Environment variables prefixed `TASKQUEUE__` with `__` separators,
///     e.g. `TASKQUEUE__STORE__DATA_DIR=/var/lib/taskqueue`
pub fn load_configuration(config_path: Option<&PathBuf>) -> Result<CliConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path.as_path()).required(true));
    }

    let config: CliConfig = builder
        .add_source(
            config::Environment::with_prefix("TASKQUEUE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    config.validate()?;
    Ok(config)
}

async fn open_queue(
    config: &CliConfig,
) -> Result<(Connection, taskqueue_runtime::StandardQueue), CliError> {
    let queue_name = QueueName::new(config.queue.clone())
        .map_err(|e| CliError::invalid_argument("queue", e))?;
    let connection = Connection::open(&config.store.to_connection_config()).await?;
    let queue = connection.open_queue(queue_name);
    Ok((connection, queue))
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Execute add command
async fn execute_add_command(
    config: &CliConfig,
    name: String,
    payload: Option<String>,
) -> Result<(), CliError> {
    let payload = match payload {
        Some(payload) => payload.into_bytes(),
        None => {
            let mut buffer = Vec::new();
            tokio::io::stdin().read_to_end(&mut buffer).await?;
            buffer
        }
    };

    let (connection, queue) = open_queue(config).await?;
    let result = queue.add(&name, &payload).await;
    connection.close().await?;

    let message_id = result.map_err(|e| match e {
        QueueError::SerializationError(e) => CliError::InvalidArgument {
            arg: "payload".to_string(),
            message: e.to_string(),
        },
        other => CliError::Queue(other),
    })?;

    println!("{}", message_id);
    Ok(())
}

/// Execute consume command
async fn execute_consume_command(
    config: &CliConfig,
    batch_size: Option<u32>,
    poll_interval_ms: Option<u64>,
    limit: Option<u64>,
) -> Result<(), CliError> {
    let options = config
        .consumer
        .to_options(batch_size, poll_interval_ms)
        .map_err(|e| CliError::invalid_argument("consume", e))?;

    let (connection, queue) = open_queue(config).await?;
    let processor = Arc::new(PrintingProcessor::new(limit));
    let handle = queue.start_consuming(options, processor.clone()).await?;

    info!(
        queue = %queue.name(),
        batch_size = options.batch_size(),
        limit = ?limit,
        "Consuming messages"
    );

    let outcome = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Interrupted, shutting down");
            Ok(())
        }
        _ = wait_for_limit(&handle, limit) => Ok(()),
        state = handle.stopped() => match state {
            ConsumerState::Failed(reason) => Err(CliError::CommandFailed { message: reason }),
            _ => Ok(()),
        },
    };

    connection.close().await?;
    info!(processed = handle.acknowledged(), "Consumer stopped");
    outcome
}

/// Resolves once `limit` deliveries were acknowledged; never without a limit
async fn wait_for_limit(handle: &ConsumerHandle, limit: Option<u64>) {
    match limit {
        Some(limit) => {
            if handle.acknowledged_at_least(limit).await < limit {
                // Consumer ended early; the stopped branch reports why
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

/// Execute stats command
async fn execute_stats_command(config: &CliConfig, format: OutputFormat) -> Result<(), CliError> {
    let (connection, queue) = open_queue(config).await?;
    let result = queue.stats().await;
    connection.close().await?;
    let stats = result?;

    match format {
        OutputFormat::Text => {
            println!("queue: {}", queue.name());
            println!("ready: {}", stats.ready);
            println!("unacked: {}", stats.unacked);
            println!("dead_lettered: {}", stats.dead_lettered);
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&stats).map_err(CliError::output)?
            );
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(&stats).map_err(CliError::output)?);
        }
    }

    Ok(())
}

/// Execute redrive command
async fn execute_redrive_command(config: &CliConfig) -> Result<(), CliError> {
    let (connection, queue) = open_queue(config).await?;
    let result = queue.redrive_dead_letters().await;
    connection.close().await?;

    println!("{}", result?);
    Ok(())
}

/// Execute config command
fn execute_config_command(config: &CliConfig, format: ConfigFormat) -> Result<(), CliError> {
    match format {
        ConfigFormat::Yaml => {
            print!("{}", serde_yaml::to_string(config).map_err(CliError::output)?);
        }
        ConfigFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(config).map_err(CliError::output)?
            );
        }
    }
    Ok(())
}

/// Execute completions command
fn execute_completions_command(shell: clap_complete::Shell) -> Result<(), CliError> {
    let mut command = Cli::command();
    clap_complete::generate(shell, &mut command, "taskqueue", &mut std::io::stdout());
    Ok(())
}

// ============================================================================
// Consumer Processor
// ============================================================================

/// Prints each message as a JSON line and stops accepting work at the limit
pub struct PrintingProcessor {
    limit: Option<u64>,
    claimed: AtomicU64,
}

impl PrintingProcessor {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            claimed: AtomicU64::new(0),
        }
    }
}

#[async_trait::async_trait]
impl MessageProcessor for PrintingProcessor {
    async fn process(&self, message: Message) -> anyhow::Result<()> {
        let claimed = self.claimed.fetch_add(1, Ordering::SeqCst);
        if self.limit.is_some_and(|limit| claimed >= limit) {
            // Past the limit: hold the delivery so closing the connection
            // hands it back to the store untouched.
            std::future::pending::<()>().await;
        }

        println!("{}", serde_json::to_string(&message)?);
        Ok(())
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
