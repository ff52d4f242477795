//! IPC Message Types
//!
//! A worker reports exactly one [`WorkerMessage`] before it exits. Messages
//! are serialized with rkyv; the task's return value travels inside
//! `Success` as JSON bytes so any serde type can be returned without making
//! the envelope generic.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Categories of task failures
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
    Serialize,
    Deserialize,
)]
#[archive(check_bytes)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// The measurement function returned an error
    Raised,
    /// The target could not be resolved to an execution context
    Context,
    /// Rust panic (caught in the worker)
    Panic,
    /// The return value could not be serialized
    Encode,
    /// The worker exited or was killed by a signal without reporting
    Crashed,
    /// The worker process could not be created
    Spawn,
    /// The worker's report was malformed or undecodable
    Protocol,
}

impl FailureKind {
    /// Stable lowercase name, used in logs and reports
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Raised => "raised",
            FailureKind::Context => "context",
            FailureKind::Panic => "panic",
            FailureKind::Encode => "encode",
            FailureKind::Crashed => "crashed",
            FailureKind::Spawn => "spawn",
            FailureKind::Protocol => "protocol",
        }
    }

    /// Whether this failure was observed on the worker side and reported over IPC
    pub fn is_reported_by_worker(self) -> bool {
        matches!(
            self,
            FailureKind::Raised | FailureKind::Context | FailureKind::Panic | FailureKind::Encode
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages sent from Worker to Supervisor
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum WorkerMessage {
    /// Task completed normally
    Success {
        /// JSON encoding of the returned value
        payload: Vec<u8>,
    },

    /// Task failed; the error was captured rather than propagated
    Failure {
        /// Error category
        kind: FailureKind,
        /// Human-readable error message (full cause chain)
        message: String,
        /// Optional backtrace
        backtrace: Option<String>,
    },
}

impl WorkerMessage {
    /// Build a failure message without a backtrace
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        WorkerMessage::Failure {
            kind,
            message: message.into(),
            backtrace: None,
        }
    }

    /// Whether this message reports a successful run
    pub fn is_success(&self) -> bool {
        matches!(self, WorkerMessage::Success { .. })
    }
}
