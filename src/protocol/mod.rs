//! Wire protocol.
//!
//! A connection carries one request frame and one response frame:
//!
//! ```text
//! Request:  [6-byte LE length][bincode JobRequest]
//! Response: [6-byte LE length][bincode JobResponse]
//! ```

pub mod frame;
pub mod job;

pub use frame::FrameCodec;
pub use job::{JobRequest, JobResponse};
