//! Request and response payloads carried inside frames.
//!
//! Both sides serialize with bincode, which writes byte vectors as a length
//! followed by the raw bytes, so image data crosses the wire without an
//! intermediate text encoding.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// One convolution job.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub input_name: String,
    pub input_bytes: Vec<u8>,
    pub kernel_name: String,
    pub kernel_bytes: Vec<u8>,
    /// How many times the kernel is applied.
    pub repeat_count: u32,
    pub grayscale: bool,
}

/// Result of a convolution job.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResponse {
    pub output_bytes: Vec<u8>,
}

impl JobRequest {
    /// Build a request from an input image and a kernel file on disk.
    ///
    /// Names are the final path components; directories stay local.
    pub fn from_files(
        input: &Path,
        kernel: &Path,
        repeat_count: u32,
        grayscale: bool,
    ) -> Result<Self> {
        Ok(Self {
            input_name: file_name(input)?,
            input_bytes: fs::read(input).map_err(|e| Error::io(input, e))?,
            kernel_name: file_name(kernel)?,
            kernel_bytes: fs::read(kernel).map_err(|e| Error::io(kernel, e))?,
            repeat_count,
            grayscale,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        decode(payload, "job request")
    }
}

impl JobResponse {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        decode(payload, "job response")
    }

    /// Write the output image to `path`.
    pub fn persist(&self, path: &Path) -> Result<()> {
        fs::write(path, &self.output_bytes).map_err(|e| Error::io(path, e))
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| Error::ProtocolViolation(format!("failed to encode payload: {e}")))
}

fn decode<T: for<'de> Deserialize<'de>>(payload: &[u8], what: &str) -> Result<T> {
    bincode::deserialize(payload)
        .map_err(|e| Error::ProtocolViolation(format!("malformed {what}: {e}")))
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            Error::io(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
            )
        })
}

impl fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRequest")
            .field("input_name", &self.input_name)
            .field("input_len", &self.input_bytes.len())
            .field("kernel_name", &self.kernel_name)
            .field("kernel_len", &self.kernel_bytes.len())
            .field("repeat_count", &self.repeat_count)
            .field("grayscale", &self.grayscale)
            .finish()
    }
}

impl fmt::Display for JobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "input {} ({} bytes), kernel {} ({} bytes), times {}, grayscale {}",
            self.input_name,
            self.input_bytes.len(),
            self.kernel_name,
            self.kernel_bytes.len(),
            self.repeat_count,
            self.grayscale
        )
    }
}

impl fmt::Debug for JobResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobResponse")
            .field("output_len", &self.output_bytes.len())
            .finish()
    }
}

impl fmt::Display for JobResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "output ({} bytes)", self.output_bytes.len())
    }
}
