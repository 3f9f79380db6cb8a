//! Configuration module for filedrop.
//!
//! Supports both command-line arguments and a TOML configuration file for
//! the server. CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::pool::OverflowPolicy;
use crate::protocol::HeaderLimits;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "filedrop")]
#[command(author = "filedrop authors")]
#[command(version = "0.1.0")]
#[command(about = "Send a single file to a filedrop server over TCP", long_about = None)]
pub struct CliArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept uploads into the upload directory
    Serve(ServeArgs),
    /// Upload one file to a server
    Send(SendArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Port to listen on
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory received files are written to
    #[arg(short = 'd', long)]
    pub upload_dir: Option<PathBuf>,

    /// Maximum number of transfers running at once
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Accepted connections allowed to wait for a free worker
    #[arg(short = 'q', long)]
    pub queue_capacity: Option<usize>,

    /// Always answer with a status token, including on header failures
    #[arg(long)]
    pub reply_on_failure: bool,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// File to upload
    pub file: PathBuf,

    /// Server host name or address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Bytes read from the file per write
    #[arg(long, default_value_t = 8192)]
    pub chunk_size: usize,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub transfer: TransferSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory received files are written to
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    /// Number of worker tasks
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bounded queue between the accept loop and the workers
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// What to do with a connection when the queue is full
    #[serde(default)]
    pub overflow: OverflowPolicy,
    /// Listen backlog passed to the OS
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upload_dir: default_upload_dir(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
            backlog: default_backlog(),
        }
    }
}

/// Per-session receive configuration
#[derive(Debug, Deserialize)]
pub struct TransferSection {
    /// Body read buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Minimum milliseconds between progress samples
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Largest accepted name length in bytes
    #[serde(default = "default_max_name_len")]
    pub max_name_len: u32,
    /// Largest accepted declared file size in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Send a status token on every failure, not only after the body
    #[serde(default)]
    pub reply_on_failure: bool,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            progress_interval_ms: default_progress_interval_ms(),
            max_name_len: default_max_name_len(),
            max_file_size: default_max_file_size(),
            reply_on_failure: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_workers() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    64
}

fn default_backlog() -> i32 {
    1024
}

fn default_buffer_size() -> usize {
    8192
}

fn default_progress_interval_ms() -> u64 {
    3000
}

fn default_max_name_len() -> u32 {
    HeaderLimits::default().max_name_len
}

fn default_max_file_size() -> u64 {
    HeaderLimits::default().max_file_size
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Settings each receiving session runs with.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub upload_dir: PathBuf,
    pub buffer_size: usize,
    pub progress_interval: Duration,
    pub limits: HeaderLimits,
    pub reply_on_failure: bool,
}

impl SessionConfig {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        let transfer = TransferSection::default();
        Self {
            upload_dir: upload_dir.into(),
            buffer_size: transfer.buffer_size,
            progress_interval: Duration::from_millis(transfer.progress_interval_ms),
            limits: HeaderLimits::default(),
            reply_on_failure: false,
        }
    }
}

/// Final resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub backlog: i32,
    pub session: SessionConfig,
    pub log_level: String,
}

impl ServerConfig {
    /// Merge serve arguments with an optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load(args: &ServeArgs, log_level: &str) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = args.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::FileRead {
                    path: config_path.clone(),
                    source: e,
                })?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse {
                path: config_path.clone(),
                source: e,
            })?
        } else {
            TomlConfig::default()
        };

        Self::merge(args, log_level, toml_config)
    }

    fn merge(args: &ServeArgs, log_level: &str, file: TomlConfig) -> Result<Self, ConfigError> {
        let config = ServerConfig {
            host: file.server.host,
            port: args.port.unwrap_or(file.server.port),
            workers: args.workers.unwrap_or(file.server.workers),
            queue_capacity: args.queue_capacity.unwrap_or(file.server.queue_capacity),
            overflow: file.server.overflow,
            backlog: file.server.backlog,
            session: SessionConfig {
                upload_dir: args
                    .upload_dir
                    .clone()
                    .unwrap_or(file.server.upload_dir),
                buffer_size: file.transfer.buffer_size,
                progress_interval: Duration::from_millis(file.transfer.progress_interval_ms),
                limits: HeaderLimits {
                    max_name_len: file.transfer.max_name_len,
                    max_file_size: file.transfer.max_file_size,
                },
                reply_on_failure: args.reply_on_failure || file.transfer.reply_on_failure,
            },
            log_level: if log_level != "info" {
                log_level.to_string()
            } else {
                file.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.session.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be at least 1".into()));
        }
        Ok(())
    }

    /// Address string handed to the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
