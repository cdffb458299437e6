//! Connection state machine for a single job.
//!
//! ```text
//! Accepted -> ReadingHeader -> ReadingPayload -> Decoded -> Executing
//!          -> Encoded -> WritingResponse -> Closed
//! ```
//!
//! Any failure before `Encoded` moves to `Errored` and then `Closed`
//! without writing anything back. A failed write still closes.

use crate::error::Result;
use crate::executor::JobExecutor;
use crate::protocol::{FrameCodec, JobRequest};
use std::net::{Shutdown, SocketAddr, TcpStream};
use tracing::trace;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Accepted,
    ReadingHeader,
    ReadingPayload {
        /// Declared payload length.
        len: u64,
    },
    Decoded,
    Executing,
    Encoded,
    WritingResponse,
    Errored,
    Closed,
}

/// One accepted client connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Accepted,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    fn transition(&mut self, next: ConnState) {
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }

    /// Drive the connection from request to close.
    ///
    /// The socket is closed on every path before this returns.
    pub fn serve(&mut self, codec: &FrameCodec, executor: &JobExecutor) -> Result<()> {
        let result = self.exchange(codec, executor);
        if result.is_err() && self.state != ConnState::WritingResponse {
            self.transition(ConnState::Errored);
        }
        self.close();
        result
    }

    fn exchange(&mut self, codec: &FrameCodec, executor: &JobExecutor) -> Result<()> {
        self.transition(ConnState::ReadingHeader);
        let len = codec.read_header(&mut self.stream)?;

        self.transition(ConnState::ReadingPayload { len });
        let payload = codec.read_payload(&mut self.stream, len)?;
        let request = JobRequest::decode(&payload)?;
        drop(payload);

        self.transition(ConnState::Decoded);
        trace!(peer = %self.peer, %request, "Request decoded");

        self.transition(ConnState::Executing);
        let (response, scratch) = executor.execute(&request)?;
        drop(request);
        let encoded = response.encode()?;
        drop(response);

        self.transition(ConnState::Encoded);
        self.transition(ConnState::WritingResponse);
        let written = codec.write_frame(&mut self.stream, &encoded);

        // The output file lives until the response is on the wire.
        drop(scratch);
        written
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.transition(ConnState::Closed);
    }
}
