//! Task Executor
//!
//! Schedules tasks onto timeout supervisors and collects their outcomes into
//! reports for the command-line front end.
//!
//! ## Pipeline Overview
//!
//! ```text
//! submit(function, target, args)
//!       │
//!       ▼
//! ┌─────────────┐
//! │  execution  │  Policy + isolation → Supervisor → TaskFuture
//! └──────┬──────┘
//!        │
//!        ▼
//! ┌─────────────┐
//! │   report    │  Outcomes → RunReport + summary
//! └──────┬──────┘
//!        │
//!        ▼
//! ┌─────────────┐
//! │ formatting  │  Human-readable output
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`execution`] - Executor, submission policies and configuration
//! - [`report`] - Run records and summaries
//! - [`formatting`] - Human-readable output formatting

mod execution;
mod formatting;
mod report;

// Re-export public API
pub use execution::{Executor, ExecutorConfig, ExecutorError, Policy};
pub use formatting::format_human_output;
pub use report::{RunRecord, RunReport, RunSummary, build_report};
