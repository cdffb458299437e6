//! Length-prefixed framing.
//!
//! ```text
//! Frame: [6-byte little-endian length][payload of exactly length bytes]
//! ```
//!
//! There is no tag or checksum: a connection carries exactly one request
//! frame followed by one response frame.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, Read, Write};

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 6;

/// Largest length the 48-bit prefix can express.
pub const MAX_FRAME_LEN: u64 = (1 << 48) - 1;

/// Default cap on a single frame payload (256 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: u64 = 256 * 1024 * 1024;

/// Payload bytes are read in chunks of this size so the buffer grows with
/// what actually arrives rather than with what the header claims.
const READ_CHUNK: usize = 64 * 1024;

/// Encode a payload as a frame.
pub fn encode(payload: &[u8]) -> Result<Bytes> {
    let len = payload.len() as u64;
    if len > MAX_FRAME_LEN {
        return Err(Error::ProtocolViolation(format!(
            "payload of {len} bytes does not fit a 48-bit length prefix"
        )));
    }

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_slice(&len.to_le_bytes()[..HEADER_LEN]);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Decode the length prefix.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> u64 {
    let mut wide = [0u8; 8];
    wide[..HEADER_LEN].copy_from_slice(header);
    u64::from_le_bytes(wide)
}

/// Reads and writes frames with an upper bound on payload size.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: u64,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl FrameCodec {
    pub fn new(max_frame_bytes: u64) -> Self {
        Self {
            max_frame_bytes: max_frame_bytes.min(MAX_FRAME_LEN),
        }
    }

    /// Read the 6-byte length prefix.
    ///
    /// Fails with `ProtocolViolation` if the peer closes before all six bytes
    /// arrive or the declared length exceeds the configured cap.
    pub fn read_header<R: Read>(&self, reader: &mut R) -> Result<u64> {
        let mut header = [0u8; HEADER_LEN];
        let got = read_full(reader, &mut header)?;
        if got < HEADER_LEN {
            return Err(Error::ProtocolViolation(format!(
                "connection closed after {got} of {HEADER_LEN} header bytes"
            )));
        }

        let len = decode_header(&header);
        if len > self.max_frame_bytes {
            return Err(Error::ProtocolViolation(format!(
                "declared frame length {len} exceeds limit of {} bytes",
                self.max_frame_bytes
            )));
        }
        Ok(len)
    }

    /// Read exactly `len` payload bytes.
    pub fn read_payload<R: Read>(&self, reader: &mut R, len: u64) -> Result<Bytes> {
        let mut payload = BytesMut::new();
        let mut remaining = len;

        while remaining > 0 {
            let chunk = remaining.min(READ_CHUNK as u64) as usize;
            let start = payload.len();
            payload.resize(start + chunk, 0);

            let got = read_full(reader, &mut payload[start..])?;
            payload.truncate(start + got);
            if got < chunk {
                return Err(Error::ProtocolViolation(format!(
                    "connection closed after {} of {len} payload bytes",
                    payload.len()
                )));
            }
            remaining -= chunk as u64;
        }

        Ok(payload.freeze())
    }

    /// Read one complete frame and return its payload.
    pub fn read_frame<R: Read>(&self, reader: &mut R) -> Result<Bytes> {
        let len = self.read_header(reader)?;
        self.read_payload(reader, len)
    }

    /// Write one frame and flush.
    pub fn write_frame<W: Write>(&self, writer: &mut W, payload: &[u8]) -> Result<()> {
        let frame = encode(payload)?;
        writer.write_all(&frame)?;
        writer.flush()?;
        Ok(())
    }
}

/// Fill `buf` as far as the reader allows, returning the byte count.
/// Anything short of `buf.len()` means EOF.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
