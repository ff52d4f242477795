#![warn(missing_docs)]
//! isorun Core - Tasks and Outcomes
//!
//! This crate provides the pieces shared by the supervisor and its workers:
//! - `Task`, `Target` and `Args` describing one unit of work
//! - `DeviceResolver` for acquiring an execution context inside the worker
//! - `Outcome` and `TaskError`, the terminal result of a task
//! - The result channel and `TaskFuture` used to hand the outcome back
//! - `execute` / `WorkerMain`, the worker side of a run

mod channel;
mod device;
mod future;
mod outcome;
mod task;
mod worker;

pub use channel::{
    OutcomePoster, OutcomeReceiver, RESULT_CHANNEL_CAPACITY, RetrievalError, result_channel,
};
pub use device::{DeviceContext, DeviceError, DeviceKind, DeviceResolver, HostDevices};
pub use future::TaskFuture;
pub use isorun_ipc::FailureKind;
pub use outcome::{Outcome, TaskError};
pub use task::{Args, Target, Task};
pub use worker::{WorkerMain, execute};
