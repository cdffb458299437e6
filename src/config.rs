//! Configuration module for convolve-relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::frame::{DEFAULT_MAX_FRAME_BYTES, MAX_FRAME_LEN};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "convolve-relay")]
#[command(author = "convolve-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "Offload image convolution jobs to a remote worker", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept jobs and run them through the convolution program
    Serve(ServeArgs),
    /// Send one job and store the result
    Send(SendArgs),
    /// Send the same job from many concurrent clients
    Load(LoadArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to bind to (e.g., localhost:24111)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of jobs handled concurrently
    #[arg(long)]
    pub max_handlers: Option<usize>,

    /// What to do with new connections while all handlers are busy
    #[arg(long, value_enum)]
    pub admission: Option<AdmissionPolicy>,

    /// Convolution program to invoke for each job
    #[arg(long)]
    pub program: Option<PathBuf>,

    /// Directory for per-job scratch files
    #[arg(long)]
    pub run_dir: Option<PathBuf>,

    /// Leave scratch directories on disk after each job
    #[arg(long)]
    pub keep_scratch: bool,

    /// Seconds to wait for in-flight jobs on shutdown (0 = no limit)
    #[arg(long)]
    pub drain_timeout: Option<u64>,
}

/// Where to find the server.
#[derive(Args, Debug, Clone)]
pub struct RemoteArgs {
    /// Address of the remote server
    #[arg(short, long, default_value = "localhost")]
    pub address: String,

    /// Port of the remote server
    #[arg(short, long, default_value_t = 24111)]
    pub port: u16,
}

impl RemoteArgs {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// What to convolve.
#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// Input image to be convoluted
    #[arg(short, long)]
    pub input: PathBuf,

    /// Kernel file to use
    #[arg(short, long)]
    pub kernel: PathBuf,

    /// Number of times to repeat the convolution
    #[arg(short, long, default_value_t = 1)]
    pub times: u32,

    /// Open the image as grayscale
    #[arg(short, long)]
    pub grayscale: bool,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub remote: RemoteArgs,

    #[command(flatten)]
    pub job: JobArgs,

    /// Output image path
    #[arg(short, long)]
    pub output: PathBuf,
}

#[derive(Args, Debug)]
pub struct LoadArgs {
    #[command(flatten)]
    pub remote: RemoteArgs,

    #[command(flatten)]
    pub job: JobArgs,

    /// Number of concurrent clients
    #[arg(short = 'n', long)]
    pub clients: usize,

    /// Store each client's result here as `<n>-<input name>`
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

/// Behavior when every handler slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Stop accepting until a slot frees; new connections queue in the
    /// listen backlog.
    Wait,
    /// Accept and immediately close.
    Reject,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Maximum concurrent handler threads
    #[serde(default = "default_max_handlers")]
    pub max_handlers: usize,
    #[serde(default = "default_admission")]
    pub admission: AdmissionPolicy,
    /// How long one accept wait may block before re-checking shutdown
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Shutdown drain limit in seconds (0 = wait forever)
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Largest accepted frame payload in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_handlers: default_max_handlers(),
            admission: default_admission(),
            poll_interval_ms: default_poll_interval_ms(),
            drain_timeout_secs: default_drain_timeout_secs(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// Job execution configuration
#[derive(Debug, Deserialize)]
pub struct ExecutorConfig {
    /// External convolution program
    #[serde(default = "default_program")]
    pub program: PathBuf,
    /// Scratch root for per-job directories
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    #[serde(default)]
    pub keep_scratch: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            run_dir: default_run_dir(),
            keep_scratch: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "localhost:24111".to_string()
}

fn default_backlog() -> i32 {
    128
}

fn default_max_handlers() -> usize {
    64
}

fn default_admission() -> AdmissionPolicy {
    AdmissionPolicy::Wait
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_drain_timeout_secs() -> u64 {
    30
}

fn default_max_frame_bytes() -> u64 {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_program() -> PathBuf {
    PathBuf::from("./build/apply_convolution")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("./run")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: i32,
    pub max_handlers: usize,
    pub admission: AdmissionPolicy,
    pub poll_interval: Duration,
    /// `None` waits for in-flight jobs indefinitely.
    pub drain_timeout: Option<Duration>,
    pub max_frame_bytes: u64,
    pub program: PathBuf,
    pub run_dir: PathBuf,
    pub keep_scratch: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(TomlConfig::default(), None, &ServeArgs::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let no_overrides = ServeArgs::default();
        let serve = match &cli.command {
            Command::Serve(args) => args,
            _ => &no_overrides,
        };

        let config = Config::merge(toml_config, cli.log_level.clone(), serve);
        config.validate()?;
        Ok(config)
    }

    fn merge(toml_config: TomlConfig, log_level: Option<String>, cli: &ServeArgs) -> Self {
        let drain_secs = cli
            .drain_timeout
            .unwrap_or(toml_config.server.drain_timeout_secs);

        Config {
            listen: cli.listen.clone().unwrap_or(toml_config.server.listen),
            backlog: toml_config.server.backlog,
            max_handlers: cli.max_handlers.unwrap_or(toml_config.server.max_handlers),
            admission: cli.admission.unwrap_or(toml_config.server.admission),
            poll_interval: Duration::from_millis(toml_config.server.poll_interval_ms.max(1)),
            drain_timeout: (drain_secs > 0).then(|| Duration::from_secs(drain_secs)),
            max_frame_bytes: toml_config.server.max_frame_bytes,
            program: cli.program.clone().unwrap_or(toml_config.executor.program),
            run_dir: cli.run_dir.clone().unwrap_or(toml_config.executor.run_dir),
            keep_scratch: cli.keep_scratch || toml_config.executor.keep_scratch,
            log_level: log_level.unwrap_or(toml_config.logging.level),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_handlers == 0 {
            return Err(ConfigError::Invalid("max_handlers must be at least 1".into()));
        }
        if self.max_frame_bytes == 0 || self.max_frame_bytes > MAX_FRAME_LEN {
            return Err(ConfigError::Invalid(format!(
                "max_frame_bytes must be between 1 and {MAX_FRAME_LEN}"
            )));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
