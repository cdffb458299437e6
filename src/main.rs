//! convolve-relay: a TCP relay for image convolution jobs
//!
//! The server accepts one job per connection, runs an external convolution
//! program over it in a per-job scratch directory and sends back the result.
//!
//! Features:
//! - Length-prefixed bincode framing
//! - Thread per connection with a bounded handler count
//! - Graceful shutdown on SIGINT/SIGTERM with a drain timeout
//! - Client `send` and `load` commands
//! - Configuration via CLI arguments or TOML file

mod client;
mod config;
mod error;
mod executor;
mod kernel;
mod protocol;
mod runtime;
mod server;

use clap::Parser;
use config::{CliArgs, Command, Config};
use protocol::FrameCodec;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();
    let config = Config::load(&cli)?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match &cli.command {
        Command::Serve(_) => {
            info!(
                listen = %config.listen,
                max_handlers = config.max_handlers,
                admission = ?config.admission,
                program = %config.program.display(),
                run_dir = %config.run_dir.display(),
                "Starting convolve-relay server"
            );
            runtime::run(config)?;
        }
        Command::Send(args) => client::send(args, FrameCodec::new(config.max_frame_bytes))?,
        Command::Load(args) => client::load(args, FrameCodec::new(config.max_frame_bytes))?,
    }
    Ok(())
}
