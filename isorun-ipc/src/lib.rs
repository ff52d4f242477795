#![warn(missing_docs)]
//! isorun IPC Protocol
//!
//! Binary protocol for reporting a worker's single outcome to its supervisor.
//! Uses rkyv for the envelope and length-prefixed framing over a pipe.

mod framing;
mod messages;

pub use framing::{FrameBuffer, FrameError, FrameWriter, MAX_FRAME_SIZE, write_frame};
pub use messages::{FailureKind, WorkerMessage};

/// Exit code a worker uses when it could not deliver its report
pub const WORKER_EXIT_REPORT_FAILED: i32 = 70;
