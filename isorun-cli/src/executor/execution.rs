//! Task Execution
//!
//! [`Executor`] accepts tasks and hands each one to a [`Supervisor`].
//!
//! ## Submission Policies
//!
//! - **Pooled**: `submit` returns immediately. The supervise cycle runs on a
//!   rayon pool of `pool_size` threads, or on a dedicated thread per task when
//!   no size is configured. Workers of different tasks may overlap.
//!
//! - **Single-flight**: `submit` runs the whole spawn/wait/kill/reap cycle on
//!   the calling thread under a mutex. At most one worker from this executor is
//!   alive at any time, and the returned future is already resolved.
//!
//! ## Data Flow
//!
//! ```text
//! submit(function, target, args)
//!        │
//!        ▼
//!   Task + task id
//!        │
//!        ├── in-process ──► execute() inline ──────────────► TaskFuture::ready
//!        │
//!        ▼
//! ┌──────────────────┐
//! │    Supervisor    │  fork → wait → kill tree → reap → post
//! └────────┬─────────┘
//!          │ result channel
//!          ▼
//!     TaskFuture<T>
//! ```

use crate::config::IsolationMode;
use crate::supervisor::Supervisor;
use isorun_core::{
    Args, DeviceResolver, HostDevices, Outcome, Target, Task, TaskFuture, execute, result_channel,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// How submitted tasks are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Supervise in the background; `None` means one thread per task
    Pooled {
        /// Number of supervisor threads
        pool_size: Option<usize>,
    },
    /// Supervise on the submitting thread, one task at a time
    SingleFlight,
}

impl Default for Policy {
    fn default() -> Self {
        Policy::Pooled { pool_size: None }
    }
}

/// Configuration for an [`Executor`]
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Wall-clock budget per task, measured from worker start
    pub timeout: Duration,
    /// Submission policy
    pub policy: Policy,
    /// Whether tasks run in forked workers
    pub isolation: IsolationMode,
}

impl ExecutorConfig {
    /// Pooled, process-isolated configuration with the given timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            policy: Policy::default(),
            isolation: IsolationMode::default(),
        }
    }

    /// Set the submission policy
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the isolation mode
    pub fn with_isolation(mut self, isolation: IsolationMode) -> Self {
        self.isolation = isolation;
        self
    }

    fn validate(&self) -> Result<(), ExecutorError> {
        if self.timeout.is_zero() {
            return Err(ExecutorError::InvalidConfig(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if let Policy::Pooled { pool_size: Some(0) } = self.policy {
            return Err(ExecutorError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// Failure to hand a task off. Task failures are reported as outcomes instead.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The per-task supervisor thread could not be created
    #[error("Failed to start supervisor thread: {0}")]
    Spawn(#[from] io::Error),

    /// The rayon pool could not be built
    #[error("Failed to build supervisor pool: {0}")]
    ThreadPool(String),

    /// Zero timeout or empty pool
    #[error("Invalid executor configuration: {0}")]
    InvalidConfig(String),
}

/// Runs tasks in isolated, deadline-bounded workers
pub struct Executor<R: DeviceResolver = HostDevices> {
    config: ExecutorConfig,
    supervisor: Supervisor<R>,
    pool: Option<rayon::ThreadPool>,
    gate: Mutex<()>,
    next_task_id: AtomicU64,
}

impl Executor<HostDevices> {
    /// Create an executor that resolves targets against the host's devices
    pub fn new(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        Self::with_resolver(config, HostDevices)
    }
}

impl<R: DeviceResolver> Executor<R> {
    /// Create an executor with a custom device resolver
    pub fn with_resolver(config: ExecutorConfig, resolver: R) -> Result<Self, ExecutorError> {
        config.validate()?;

        let pool = match config.policy {
            Policy::Pooled {
                pool_size: Some(threads),
            } if config.isolation.is_isolated() => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("isorun-pool-{}", i))
                    .build()
                    .map_err(|e| ExecutorError::ThreadPool(e.to_string()))?,
            ),
            _ => None,
        };

        tracing::debug!(
            timeout_ms = config.timeout.as_millis() as u64,
            policy = ?config.policy,
            isolation = ?config.isolation,
            "executor created"
        );

        Ok(Self {
            supervisor: Supervisor::new(Arc::new(resolver), config.timeout),
            config,
            pool,
            gate: Mutex::new(()),
            next_task_id: AtomicU64::new(1),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Submit `function` to run against `target` with `args`.
    pub fn submit<F, T>(
        &self,
        function: F,
        target: impl Into<Target>,
        args: Args,
    ) -> Result<TaskFuture<T>, ExecutorError>
    where
        F: FnOnce(&R::Context, &Args) -> anyhow::Result<T> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.submit_task(Task::new(function, target, args))
    }

    /// Submit a prepared [`Task`].
    pub fn submit_task<F, T>(&self, task: Task<F>) -> Result<TaskFuture<T>, ExecutorError>
    where
        F: FnOnce(&R::Context, &Args) -> anyhow::Result<T> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(task_id, target = %task.target, "task submitted");

        if let Policy::SingleFlight = self.config.policy {
            let _gate = self.gate.lock();
            return Ok(self.run_inline(task_id, task));
        }

        if !self.config.isolation.is_isolated() {
            return Ok(self.run_inline(task_id, task));
        }

        let (poster, receiver) = result_channel();
        let supervisor = self.supervisor.clone();
        let job = move || supervisor.supervise(task_id, task, &poster);

        match &self.pool {
            Some(pool) => pool.spawn(job),
            None => {
                thread::Builder::new()
                    .name(format!("isorun-supervisor-{}", task_id))
                    .spawn(job)?;
            }
        }

        Ok(TaskFuture::new(task_id, receiver))
    }

    /// Run to completion on the calling thread
    fn run_inline<F, T>(&self, task_id: u64, task: Task<F>) -> TaskFuture<T>
    where
        F: FnOnce(&R::Context, &Args) -> anyhow::Result<T>,
        T: Serialize + DeserializeOwned,
    {
        match self.config.isolation {
            IsolationMode::Process => TaskFuture::new(task_id, self.supervisor.run(task_id, task)),
            IsolationMode::InProcess => {
                // Same encode/decode path as a worker so values behave identically
                let outcome = Outcome::from_message(execute(self.supervisor.resolver(), task));
                TaskFuture::ready(task_id, outcome)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isorun_core::DeviceContext;

    fn pid_probe(ctx: &DeviceContext, _: &Args) -> anyhow::Result<u32> {
        Ok(ctx.owner_pid)
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = Executor::new(ExecutorConfig::new(Duration::ZERO)).err().unwrap();
        assert!(matches!(err, ExecutorError::InvalidConfig(_)));
    }

    #[test]
    fn test_empty_pool_rejected() {
        let config = ExecutorConfig::default().with_policy(Policy::Pooled { pool_size: Some(0) });
        assert!(matches!(
            Executor::new(config),
            Err(ExecutorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_task_ids_increase() {
        let executor = Executor::new(
            ExecutorConfig::default().with_isolation(IsolationMode::InProcess),
        )
        .unwrap();
        let first = executor.submit(pid_probe, "llvm", Args::new()).unwrap();
        let second = executor.submit(pid_probe, "llvm", Args::new()).unwrap();
        assert!(second.task_id() > first.task_id());
    }

    #[test]
    fn test_in_process_runs_in_caller() {
        let executor = Executor::new(
            ExecutorConfig::default().with_isolation(IsolationMode::InProcess),
        )
        .unwrap();
        let mut future = executor.submit(pid_probe, "cpu", Args::new()).unwrap();
        assert!(future.done());
        assert_eq!(
            future.get(None).unwrap(),
            &Outcome::Success(std::process::id())
        );
    }

    #[test]
    fn test_single_flight_future_is_resolved() {
        let executor = Executor::new(
            ExecutorConfig::new(Duration::from_secs(5)).with_policy(Policy::SingleFlight),
        )
        .unwrap();
        let mut future = executor
            .submit(
                |_: &DeviceContext, args: &Args| Ok(args.positional().len()),
                "llvm",
                Args::new().arg(1).arg(2),
            )
            .unwrap();
        assert!(future.done());
        assert_eq!(future.get(Some(Duration::ZERO)).unwrap(), &Outcome::Success(2));
    }

    #[test]
    fn test_sized_pool_runs_every_task() {
        let executor = Executor::new(
            ExecutorConfig::new(Duration::from_secs(5))
                .with_policy(Policy::Pooled { pool_size: Some(2) }),
        )
        .unwrap();

        let futures: Vec<_> = (0..5u64)
            .map(|i| {
                executor
                    .submit(
                        |_: &DeviceContext, args: &Args| {
                            Ok(args.get(0).and_then(|v| v.as_u64()).unwrap_or(0) * 10)
                        },
                        "llvm",
                        Args::new().arg(i),
                    )
                    .unwrap()
            })
            .collect();

        let values: Vec<u64> = futures
            .into_iter()
            .map(|f| *f.into_outcome(None).unwrap().value().unwrap())
            .collect();
        assert_eq!(values, vec![0, 10, 20, 30, 40]);
    }
}
