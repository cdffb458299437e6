//! Thread-per-connection runtime.
//!
//! - `Connection`: per-job state machine over a blocking socket
//! - `HandlerRegistry`: bounded set of handler threads with completion reaping
//! - `ShutdownSignal`: SIGINT/SIGTERM flag polled by the accept loop

mod connection;
mod registry;
mod shutdown;

pub(crate) use connection::Connection;
pub(crate) use registry::HandlerRegistry;
pub use shutdown::ShutdownSignal;

use crate::config::Config;
use crate::error::Error;
use crate::executor::{JobExecutor, ProcessConvolver};
use crate::server::{ServeReport, Server};
use std::io;
use std::sync::Arc;
use tracing::{info, warn};

/// Run the server until SIGINT or SIGTERM, then drain.
pub fn run(config: Config) -> Result<ServeReport, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.run_dir).map_err(|e| Error::io(&config.run_dir, e))?;

    // A bare name is looked up on PATH at spawn time.
    if config.program.components().count() > 1 && !config.program.exists() {
        return Err(Error::io(
            &config.program,
            io::Error::new(io::ErrorKind::NotFound, "convolution program not found"),
        )
        .into());
    }

    let convolver = Arc::new(ProcessConvolver::new(&config.program));
    let executor = Arc::new(JobExecutor::new(
        &config.run_dir,
        config.keep_scratch,
        convolver,
    ));

    let shutdown = ShutdownSignal::install()?;
    let server = Server::bind(&config, executor)?;

    let report = server.run(&shutdown)?;
    if report.abandoned > 0 {
        warn!(abandoned = report.abandoned, "Exiting with unfinished jobs");
    } else {
        info!("All jobs finished");
    }
    Ok(report)
}
