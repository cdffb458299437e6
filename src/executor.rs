//! Job execution.
//!
//! Each job gets its own scratch directory under the run directory:
//!
//! ```text
//! run/job-XXXXXX/
//!     input/<input name>
//!     kernel/<kernel name>
//!     <uuid>.<input extension>      written by the convolution step
//! ```
//!
//! The directory is removed when the `ScratchJob` is dropped, which the
//! connection handler does only after the response has been written.

use crate::error::{Error, Result};
use crate::protocol::{JobRequest, JobResponse};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, trace};
use uuid::Uuid;

/// Bytes of stderr kept in an `ExternalProcess` error.
const STDERR_TAIL: usize = 512;

/// Paths and parameters for one invocation of the convolution step.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub input: PathBuf,
    pub kernel: PathBuf,
    pub output: PathBuf,
    pub repeat_count: u32,
    pub grayscale: bool,
}

impl Invocation {
    /// Argument list passed to an external convolution program.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--input".into(),
            self.input.clone().into(),
            "--output".into(),
            self.output.clone().into(),
            "--kernel".into(),
            self.kernel.clone().into(),
            "--times".into(),
            self.repeat_count.to_string().into(),
        ];
        if self.grayscale {
            args.push("--grayscale".into());
        }
        args
    }
}

/// The image transform. Implementations must leave the result at
/// `invocation.output`; blocking until done is expected.
pub trait Convolver: Send + Sync {
    fn convolve(&self, invocation: &Invocation) -> Result<()>;
}

/// Runs an external program with [`Invocation::args`].
#[derive(Debug, Clone)]
pub struct ProcessConvolver {
    program: PathBuf,
}

impl ProcessConvolver {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Convolver for ProcessConvolver {
    fn convolve(&self, invocation: &Invocation) -> Result<()> {
        let output = Command::new(&self.program)
            .args(invocation.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| {
                Error::ExternalProcess(format!(
                    "failed to launch '{}': {e}",
                    self.program.display()
                ))
            })?;

        trace!(
            program = %self.program.display(),
            status = %output.status,
            stderr_len = output.stderr.len(),
            "Convolution step exited"
        );

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let start = stderr.len().saturating_sub(STDERR_TAIL);
        let start = (start..stderr.len())
            .find(|&i| stderr.is_char_boundary(i))
            .unwrap_or(stderr.len());
        Err(Error::ExternalProcess(format!(
            "'{}' exited with {}: {}",
            self.program.display(),
            output.status,
            stderr[start..].trim()
        )))
    }
}

/// On-disk materialization of one request.
#[derive(Debug)]
pub struct ScratchJob {
    dir: TempDir,
    input: PathBuf,
    kernel: PathBuf,
    output: PathBuf,
}

impl ScratchJob {
    /// Create the job directory and write the request's input and kernel.
    pub fn create(run_dir: &Path, request: &JobRequest, keep: bool) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("job-")
            .disable_cleanup(keep)
            .tempdir_in(run_dir)
            .map_err(|e| Error::io(run_dir, e))?;

        let input = place(dir.path(), "input", &request.input_name, &request.input_bytes)?;
        let kernel = place(dir.path(), "kernel", &request.kernel_name, &request.kernel_bytes)?;

        let mut output_name = Uuid::new_v4().to_string();
        if let Some(ext) = input.extension() {
            output_name.push('.');
            output_name.push_str(&ext.to_string_lossy());
        }
        let output = dir.path().join(output_name);

        Ok(Self {
            dir,
            input,
            kernel,
            output,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn kernel(&self) -> &Path {
        &self.kernel
    }

    pub fn output(&self) -> &Path {
        &self.output
    }
}

/// Write `bytes` to `<root>/<sub>/<final component of name>`, replacing any
/// file already there.
fn place(root: &Path, sub: &str, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let file_name = scratch_name(name)?;
    let dir = root.join(sub);
    fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

    let path = dir.join(file_name);
    if path.exists() {
        fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
    }
    fs::write(&path, bytes).map_err(|e| Error::io(&path, e))?;
    Ok(path)
}

/// Reduce a client-supplied name to a single path component.
fn scratch_name(name: &str) -> Result<&str> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !name.ends_with('/') && !name.ends_with('\\') && !n.is_empty())
        .ok_or_else(|| Error::ProtocolViolation(format!("unusable file name {name:?}")))
}

/// Turns a decoded request into a response by way of the convolver.
pub struct JobExecutor {
    run_dir: PathBuf,
    keep_scratch: bool,
    convolver: Arc<dyn Convolver>,
}

impl JobExecutor {
    pub fn new(run_dir: impl Into<PathBuf>, keep_scratch: bool, convolver: Arc<dyn Convolver>) -> Self {
        Self {
            run_dir: run_dir.into(),
            keep_scratch,
            convolver,
        }
    }

    /// Run one job.
    ///
    /// The returned `ScratchJob` still holds the output file; drop it once
    /// the response has been delivered.
    pub fn execute(&self, request: &JobRequest) -> Result<(JobResponse, ScratchJob)> {
        let scratch = ScratchJob::create(&self.run_dir, request, self.keep_scratch)?;
        debug!(
            scratch = %scratch.path().display(),
            input = %scratch.input().display(),
            output = %scratch.output().display(),
            "Scratch job prepared"
        );

        let invocation = Invocation {
            input: scratch.input().to_path_buf(),
            kernel: scratch.kernel().to_path_buf(),
            output: scratch.output().to_path_buf(),
            repeat_count: request.repeat_count,
            grayscale: request.grayscale,
        };
        self.convolver.convolve(&invocation)?;

        let output_bytes = match fs::read(scratch.output()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ExternalProcess(format!(
                    "no output written to '{}'",
                    scratch.output().display()
                )));
            }
            Err(e) => return Err(Error::io(scratch.output(), e)),
        };

        Ok((JobResponse { output_bytes }, scratch))
    }
}
