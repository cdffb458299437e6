//! Client side: one connection, one request, one response.

use crate::config::{JobArgs, LoadArgs, SendArgs};
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::protocol::{FrameCodec, JobRequest, JobResponse};
use std::fs;
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Sends jobs to a convolution server.
#[derive(Debug, Clone)]
pub struct Client {
    endpoint: String,
    codec: FrameCodec,
}

impl Client {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            codec: FrameCodec::default(),
        }
    }

    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Run one job remotely.
    ///
    /// Blocks until the server answers or closes the connection. A close
    /// without a complete response frame is an error.
    pub fn submit(&self, request: &JobRequest) -> Result<JobResponse> {
        let payload = request.encode()?;

        let mut stream = TcpStream::connect(&self.endpoint)?;
        debug!(endpoint = %self.endpoint, request_len = payload.len(), "Connected");

        self.codec.write_frame(&mut stream, &payload)?;
        let reply = self.codec.read_frame(&mut stream)?;
        let _ = stream.shutdown(Shutdown::Both);

        debug!(response_len = reply.len(), "Response received");
        JobResponse::decode(&reply)
    }
}

/// Read the input image and kernel named by `args`, checking that the
/// kernel parses before anything is sent.
fn build_request(args: &JobArgs) -> Result<JobRequest> {
    let request = JobRequest::from_files(&args.input, &args.kernel, args.times, args.grayscale)?;

    let kernel = Kernel::parse(&request.kernel_bytes).map_err(|source| Error::InvalidKernel {
        path: args.kernel.clone(),
        source,
    })?;
    debug!(
        rows = kernel.rows(),
        cols = kernel.cols(),
        sum = kernel.sum(),
        "Kernel loaded"
    );

    Ok(request)
}

/// `send`: submit one job and store the result at `args.output`.
pub fn send(args: &SendArgs, codec: FrameCodec) -> Result<()> {
    let request = build_request(&args.job)?;
    let client = Client::new(args.remote.endpoint()).with_codec(codec);

    info!(endpoint = %client.endpoint(), %request, "Sending request");
    let started = Instant::now();
    let response = client.submit(&request)?;

    response.persist(&args.output)?;
    info!(
        output = %args.output.display(),
        bytes = response.output_bytes.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Result stored"
    );
    Ok(())
}

/// `load`: submit the same job from `args.clients` threads at once.
pub fn load(args: &LoadArgs, codec: FrameCodec) -> Result<()> {
    let request = Arc::new(build_request(&args.job)?);
    let client = Client::new(args.remote.endpoint()).with_codec(codec);

    if let Some(dir) = &args.output_dir {
        fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
    }

    info!(
        endpoint = %client.endpoint(),
        clients = args.clients,
        %request,
        "Starting load"
    );
    let started = Instant::now();

    let workers: Vec<_> = (0..args.clients)
        .map(|n| {
            let client = client.clone();
            let request = Arc::clone(&request);
            let output = args
                .output_dir
                .as_ref()
                .map(|dir| dir.join(format!("{n}-{}", request.input_name)));
            thread::spawn(move || run_one(&client, &request, output.as_deref()))
        })
        .collect();

    let mut failed = 0;
    for (n, worker) in workers.into_iter().enumerate() {
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(client = n, error = %e, "Request failed");
                failed += 1;
            }
            Err(_) => {
                warn!(client = n, "Client thread panicked");
                failed += 1;
            }
        }
    }

    info!(
        clients = args.clients,
        failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Load finished"
    );

    if failed > 0 {
        return Err(Error::LoadFailed {
            failed,
            total: args.clients,
        });
    }
    Ok(())
}

fn run_one(client: &Client, request: &JobRequest, output: Option<&Path>) -> Result<()> {
    let response = client.submit(request)?;
    if let Some(path) = output {
        response.persist(path)?;
    }
    Ok(())
}
