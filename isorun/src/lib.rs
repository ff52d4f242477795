#![warn(missing_docs)]
//! # isorun
//!
//! Run measurement functions in forked worker processes under a wall-clock
//! deadline, and collect their outcomes through futures.
//!
//! isorun is built for autotuning-style workloads where a candidate kernel may
//! hang, crash or leak helper processes:
//! - **Process Isolation**: each task runs in its own forked worker and process group
//! - **Hard Deadlines**: overrunning workers and all their descendants are killed and reaped
//! - **Outcomes as Data**: `Success`, `Failure` (never re-raised) or `TimedOut`,
//!   exactly one per task
//! - **Late Context Resolution**: only an inert [`Target`] crosses the process boundary;
//!   device contexts are created inside the worker
//! - **Policies**: pooled background supervision or single-flight (one worker at a time)
//!
//! ## Quick Start
//!
//! ```ignore
//! use isorun::prelude::*;
//! use std::time::Duration;
//!
//! let executor = Executor::new(ExecutorConfig::new(Duration::from_secs(5)))?;
//! let mut future = executor.submit(
//!     |ctx: &DeviceContext, args: &Args| {
//!         let n = args.get(0).and_then(|v| v.as_u64()).unwrap_or(0);
//!         Ok(n * 2)
//!     },
//!     "llvm",
//!     Args::new().arg(21),
//! )?;
//!
//! match future.get(None)? {
//!     Outcome::Success(value) => println!("got {value}"),
//!     Outcome::Failure(error) => println!("failed: {error}"),
//!     Outcome::TimedOut => println!("killed at deadline"),
//! }
//! ```
//!
//! ## Single-Flight
//!
//! ```ignore
//! let executor = Executor::new(
//!     ExecutorConfig::new(Duration::from_secs(1)).with_policy(Policy::SingleFlight),
//! )?;
//! // Blocks until the worker is done and reaped; the future is already resolved.
//! let future = executor.submit(measure, "llvm -device_id=0", Args::new())?;
//! ```

// Re-export core types
pub use isorun_core::{
    Args, DeviceContext, DeviceError, DeviceKind, DeviceResolver, FailureKind, HostDevices,
    Outcome, OutcomePoster, OutcomeReceiver, RetrievalError, Target, Task, TaskError, TaskFuture,
    execute, result_channel,
};

// Re-export executor, supervisor and configuration
pub use isorun_cli::{
    Executor, ExecutorConfig, ExecutorError, FileConfig, IsolationMode, Policy, ProcessTree,
    Supervisor, SupervisorError, parse_duration, run,
};

/// Wire-level types shared by supervisor and worker
pub mod ipc {
    pub use isorun_ipc::{FrameBuffer, FrameError, FrameWriter, WorkerMessage, write_frame};
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Args, DeviceContext, DeviceResolver, Executor, ExecutorConfig, IsolationMode, Outcome,
        Policy, RetrievalError, Target, TaskError, TaskFuture,
    };
}
