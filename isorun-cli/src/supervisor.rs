//! Timeout Supervisor
//!
//! Forks one worker per task, watches its report pipe against a wall-clock
//! deadline, and tears the worker's process tree down afterwards.
//!
//! ```text
//! supervise(task)
//!   ├── pipe + fork ───────────► worker: setpgid, subreaper, run, write frame, park
//!   ├── poll pipe (100 ms slices) until frame / exit / deadline
//!   ├── decide outcome (report, crash, or TimedOut if still alive at deadline)
//!   ├── SIGKILL process group + /proc descendants
//!   ├── waitpid (no zombie)
//!   └── post outcome (first writer wins)
//! ```
//!
//! The outcome is posted last, so a caller that observes it knows the worker
//! and its descendants have already been killed and reaped.
//!
//! A worker that reported stays parked until it is killed. On Linux it is also
//! a child subreaper, so helpers that left its process group and lost their
//! parent are reparented to it and still show up in the tree snapshot.

use crate::process_tree::ProcessTree;
use isorun_core::{
    Args, DeviceResolver, FailureKind, Outcome, OutcomePoster, OutcomeReceiver, Task, TaskError,
    WorkerMain, result_channel,
};
use isorun_ipc::{FrameBuffer, FrameError, WorkerMessage};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Longest single poll on the report pipe before re-checking worker liveness
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Failure to start a worker
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// `pipe` or `fcntl` failed
    #[error("Failed to create report pipe: {0}")]
    Pipe(io::Error),

    /// `fork` failed (process limit, memory)
    #[error("Failed to fork worker: {0}")]
    Fork(io::Error),
}

/// Result of polling for data
#[derive(Debug)]
enum PollResult {
    DataAvailable,
    Timeout,
    PipeClosed,
    Error(io::Error),
}

/// Wait for data to be available on a file descriptor with timeout
fn wait_for_data(fd: RawFd, timeout: Duration) -> PollResult {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    // Round up so a sub-millisecond remainder does not turn into a busy loop
    let timeout_ms = timeout.as_millis().clamp(1, i32::MAX as u128) as i32;
    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

    if result < 0 {
        PollResult::Error(io::Error::last_os_error())
    } else if result == 0 {
        PollResult::Timeout
    } else if pollfd.revents & libc::POLLIN != 0 {
        // Even if the pipe is closing there may be data left
        PollResult::DataAvailable
    } else if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        PollResult::PipeClosed
    } else {
        PollResult::Timeout
    }
}

/// Create a pipe pair with close-on-exec set, returning (read_fd, write_fd).
fn create_pipe() -> Result<(RawFd, RawFd), io::Error> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    // Helpers the worker execs must not hold the report pipe open
    for &fd in &fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
    Ok((fds[0], fds[1]))
}

fn set_nonblocking(fd: RawFd) -> Result<(), io::Error> {
    let ret = unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)
    };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Close a raw file descriptor.
fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Make the worker adopt its orphaned descendants and die with its supervisor.
#[cfg(target_os = "linux")]
fn adopt_orphans(supervisor: libc::pid_t) {
    unsafe {
        libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1 as libc::c_ulong, 0, 0, 0);
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0);
        // The supervisor may have gone before the death signal was armed
        if libc::getppid() != supervisor {
            libc::_exit(isorun_ipc::WORKER_EXIT_REPORT_FAILED);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn adopt_orphans(_supervisor: libc::pid_t) {}

/// Block until a signal ends the process.
fn park() -> ! {
    loop {
        unsafe {
            libc::pause();
        }
    }
}

/// Parent side of the report pipe
struct ReportReader {
    file: File,
    frames: FrameBuffer,
    eof: bool,
}

impl ReportReader {
    fn new(file: File) -> Self {
        Self {
            file,
            frames: FrameBuffer::new(),
            eof: false,
        }
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Read everything currently in the pipe without blocking and decode the
    /// report if it is complete.
    fn drain(&mut self) -> Result<Option<WorkerMessage>, FrameError> {
        let mut chunk = [0u8; 8192];
        while !self.eof {
            match self.file.read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(n) => self.frames.extend(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(FrameError::Io(e)),
            }
        }
        self.frames.try_decode()
    }
}

/// Handle on a forked worker. The pid doubles as the worker's process group.
pub struct WorkerProcess {
    pid: u32,
    status: Option<ExitStatus>,
    reaped: bool,
}

impl WorkerProcess {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            status: None,
            reaped: false,
        }
    }

    /// Worker pid
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the worker has terminated. The zombie is left in place so the
    /// pid and process group stay reserved until [`WorkerProcess::reap`].
    #[cfg(target_os = "linux")]
    pub fn has_exited(&mut self) -> bool {
        if self.reaped {
            return true;
        }
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            libc::waitid(
                libc::P_PID,
                self.pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            )
        };
        if ret != 0 {
            // ECHILD: nothing left to wait for
            return true;
        }
        unsafe { info.si_pid() != 0 }
    }

    /// Whether the worker has terminated (reaps it on platforms without `WNOWAIT` probing).
    #[cfg(not(target_os = "linux"))]
    pub fn has_exited(&mut self) -> bool {
        if self.reaped {
            return true;
        }
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(self.pid as libc::pid_t, &mut status, libc::WNOHANG) };
        match ret {
            0 => false,
            -1 => {
                self.reaped = true;
                true
            }
            _ => {
                self.status = Some(ExitStatus::from_raw(status));
                self.reaped = true;
                true
            }
        }
    }

    /// Kill the worker's process group and every descendant. Idempotent.
    pub fn terminate(&self) -> usize {
        if self.reaped {
            return 0;
        }
        let tree = ProcessTree::snapshot(self.pid);
        tracing::trace!(
            root = tree.root(),
            descendants = tree.descendants().count(),
            "killing worker tree"
        );
        tree.kill()
    }

    /// Wait for the worker to terminate and collect its exit status.
    pub fn reap(&mut self) -> Option<ExitStatus> {
        if self.reaped {
            return self.status;
        }
        let mut status: libc::c_int = 0;
        loop {
            let ret = unsafe { libc::waitpid(self.pid as libc::pid_t, &mut status, 0) };
            if ret == self.pid as libc::pid_t {
                self.status = Some(ExitStatus::from_raw(status));
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                tracing::warn!(pid = self.pid, error = %err, "failed to reap worker");
                break;
            }
        }
        self.reaped = true;
        self.status
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if !self.reaped {
            self.terminate();
            self.reap();
        }
    }
}

/// What the supervisor observed before tearing the worker down
#[derive(Debug)]
enum Verdict {
    Reported(WorkerMessage),
    Malformed(String),
    Exited,
    Deadline,
    Lost(io::Error),
}

impl Verdict {
    /// Accept a decoded report. Kinds only the supervisor may assign are a
    /// protocol violation when they arrive from a worker.
    fn from_report(message: WorkerMessage) -> Self {
        match &message {
            WorkerMessage::Failure { kind, .. } if !kind.is_reported_by_worker() => {
                Verdict::Malformed(format!("worker reported a '{}' failure", kind))
            }
            _ => Verdict::Reported(message),
        }
    }

    fn into_outcome<T: DeserializeOwned>(self, status: Option<ExitStatus>) -> Outcome<T> {
        let describe = || {
            status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "exit status unavailable".to_string())
        };
        match self {
            Verdict::Reported(message) => Outcome::from_message(message),
            Verdict::Deadline => Outcome::TimedOut,
            Verdict::Exited => Outcome::Failure(TaskError::new(
                FailureKind::Crashed,
                format!("worker exited without reporting ({})", describe()),
            )),
            Verdict::Malformed(e) => Outcome::Failure(TaskError::new(
                FailureKind::Protocol,
                format!("malformed worker report: {}", e),
            )),
            Verdict::Lost(e) => Outcome::Failure(TaskError::new(
                FailureKind::Protocol,
                format!("lost contact with worker: {} ({})", e, describe()),
            )),
        }
    }
}

/// Runs tasks in forked workers under a wall-clock deadline
pub struct Supervisor<R> {
    resolver: Arc<R>,
    timeout: Duration,
}

impl<R> Clone for Supervisor<R> {
    fn clone(&self) -> Self {
        Self {
            resolver: Arc::clone(&self.resolver),
            timeout: self.timeout,
        }
    }
}

impl<R: DeviceResolver> Supervisor<R> {
    /// Create a supervisor enforcing `timeout` per task
    pub fn new(resolver: Arc<R>, timeout: Duration) -> Self {
        Self { resolver, timeout }
    }

    /// Per-task deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolver used inside workers
    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Run `task` to completion and return the channel holding its outcome.
    pub fn run<F, T>(&self, task_id: u64, task: Task<F>) -> OutcomeReceiver<T>
    where
        F: FnOnce(&R::Context, &Args) -> anyhow::Result<T>,
        T: Serialize + DeserializeOwned,
    {
        let (poster, receiver) = result_channel();
        self.supervise(task_id, task, &poster);
        receiver
    }

    /// Spawn, watch, kill and reap one worker, then post its outcome.
    pub fn supervise<F, T>(&self, task_id: u64, task: Task<F>, poster: &OutcomePoster<T>)
    where
        F: FnOnce(&R::Context, &Args) -> anyhow::Result<T>,
        T: Serialize + DeserializeOwned,
    {
        let started = Instant::now();
        let target = task.target.to_string();

        let (mut worker, mut reader) = match self.spawn(task) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(task_id, target = %target, error = %e, "failed to spawn worker");
                poster.post(Outcome::Failure(TaskError::new(
                    FailureKind::Spawn,
                    e.to_string(),
                )));
                return;
            }
        };
        let pid = worker.pid();
        tracing::debug!(task_id, pid, target = %target, "worker spawned");

        let verdict = self.watch(&mut worker, &mut reader, started);
        match &verdict {
            Verdict::Reported(message) => {
                tracing::debug!(task_id, pid, success = message.is_success(), "worker reported");
            }
            Verdict::Deadline => {
                tracing::warn!(
                    task_id,
                    pid,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "worker exceeded deadline; killing process tree"
                );
            }
            _ => {}
        }

        let signalled = worker.terminate();
        let status = worker.reap();
        tracing::debug!(
            task_id,
            pid,
            signalled,
            status = ?status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "worker reaped"
        );

        let outcome = verdict.into_outcome(status);
        if let Outcome::Failure(error) = &outcome {
            tracing::debug!(task_id, kind = %error.kind, message = %error.message, "task failed");
        }
        poster.post(outcome);
    }

    /// Fork a worker that runs `task` and reports on a fresh pipe.
    fn spawn<F, T>(&self, task: Task<F>) -> Result<(WorkerProcess, ReportReader), SupervisorError>
    where
        F: FnOnce(&R::Context, &Args) -> anyhow::Result<T>,
        T: Serialize,
    {
        let (read_fd, write_fd) = create_pipe().map_err(SupervisorError::Pipe)?;

        let supervisor = unsafe { libc::getpid() };
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            let err = io::Error::last_os_error();
            close_fd(read_fd);
            close_fd(write_fd);
            return Err(SupervisorError::Fork(err));
        }

        if pid == 0 {
            // Worker: own process group so the whole tree can be killed at once
            unsafe {
                libc::setpgid(0, 0);
                libc::close(read_fd);
            }
            adopt_orphans(supervisor);
            let pipe = unsafe { File::from_raw_fd(write_fd) };
            let code = WorkerMain::new(pipe).run(self.resolver.as_ref(), task);
            if code == 0 {
                // The tree is only found through a live worker; wait for the kill
                park();
            }
            // Skip destructors and atexit handlers inherited from the parent
            unsafe { libc::_exit(code) }
        }

        // Also set the group from the parent so it is in place before any kill,
        // whichever side runs first. ESRCH/EACCES mean the child got there already.
        unsafe {
            libc::setpgid(pid, pid);
        }
        close_fd(write_fd);

        let worker = WorkerProcess::new(pid as u32);
        let file = unsafe { File::from_raw_fd(read_fd) };
        set_nonblocking(read_fd).map_err(SupervisorError::Pipe)?;

        Ok((worker, ReportReader::new(file)))
    }

    /// Poll the report pipe until a report, a worker exit, or the deadline.
    fn watch(
        &self,
        worker: &mut WorkerProcess,
        reader: &mut ReportReader,
        started: Instant,
    ) -> Verdict {
        loop {
            let remaining = self.timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                // A report that landed right at the deadline still wins
                return match reader.drain() {
                    Ok(Some(message)) => Verdict::from_report(message),
                    Ok(None) if worker.has_exited() => Verdict::Exited,
                    Ok(None) => Verdict::Deadline,
                    Err(e) => Verdict::Malformed(e.to_string()),
                };
            }

            match wait_for_data(reader.fd(), remaining.min(POLL_INTERVAL)) {
                PollResult::DataAvailable | PollResult::PipeClosed => match reader.drain() {
                    Ok(Some(message)) => return Verdict::from_report(message),
                    Ok(None) if reader.eof => return Verdict::Exited,
                    // Partial frame; the rest is still on its way
                    Ok(None) => {}
                    Err(e) => return Verdict::Malformed(e.to_string()),
                },
                PollResult::Timeout => {
                    // Another worker forked concurrently may hold a copy of our write
                    // end, so EOF is not guaranteed; check liveness directly.
                    if worker.has_exited() {
                        return match reader.drain() {
                            Ok(Some(message)) => Verdict::from_report(message),
                            Ok(None) => Verdict::Exited,
                            Err(e) => Verdict::Malformed(e.to_string()),
                        };
                    }
                }
                PollResult::Error(e) if e.kind() == io::ErrorKind::Interrupted => {}
                PollResult::Error(e) => return Verdict::Lost(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isorun_core::{DeviceContext, HostDevices};

    fn supervisor(timeout: Duration) -> Supervisor<HostDevices> {
        Supervisor::new(Arc::new(HostDevices), timeout)
    }

    #[test]
    fn test_success_relayed() {
        let task = Task::new(
            |ctx: &DeviceContext, _: &Args| Ok(ctx.owner_pid),
            "llvm",
            Args::new(),
        );
        let outcome = supervisor(Duration::from_secs(5))
            .run(1, task)
            .recv(None)
            .unwrap();
        let worker_pid = *outcome.value().unwrap();
        // The context was resolved in the forked worker, not here
        assert_ne!(worker_pid, std::process::id());
    }

    #[test]
    fn test_deadline_yields_timed_out() {
        let task = Task::new(
            |_: &DeviceContext, _: &Args| -> anyhow::Result<u32> {
                std::thread::sleep(Duration::from_secs(10));
                Ok(1)
            },
            "llvm",
            Args::new(),
        );
        let started = Instant::now();
        let outcome = supervisor(Duration::from_millis(300))
            .run(2, task)
            .recv(None)
            .unwrap();
        assert_eq!(outcome, Outcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_abort_is_crash() {
        let task = Task::new(
            |_: &DeviceContext, _: &Args| -> anyhow::Result<u32> { std::process::abort() },
            "llvm",
            Args::new(),
        );
        let outcome = supervisor(Duration::from_secs(5))
            .run(3, task)
            .recv(None)
            .unwrap();
        let error = outcome.error().unwrap();
        assert_eq!(error.kind, FailureKind::Crashed);
        assert!(error.message.contains("signal"), "{}", error.message);
    }

    #[test]
    fn test_exit_without_report_is_crash() {
        let task = Task::new(
            |_: &DeviceContext, _: &Args| -> anyhow::Result<u32> { std::process::exit(3) },
            "llvm",
            Args::new(),
        );
        let outcome = supervisor(Duration::from_secs(5))
            .run(4, task)
            .recv(None)
            .unwrap();
        let error = outcome.error().unwrap();
        assert_eq!(error.kind, FailureKind::Crashed);
        assert!(error.message.contains("exit status: 3"), "{}", error.message);
    }

    #[test]
    fn test_large_result_is_streamed() {
        // Larger than a pipe buffer: the worker blocks until the supervisor reads
        let task = Task::new(
            |_: &DeviceContext, _: &Args| Ok(vec![1.5f64; 100_000]),
            "llvm",
            Args::new(),
        );
        let outcome = supervisor(Duration::from_secs(10))
            .run(5, task)
            .recv(None)
            .unwrap();
        assert_eq!(outcome.value().map(Vec::len), Some(100_000));
    }

    #[test]
    fn test_verdict_descriptions() {
        let outcome: Outcome<u32> = Verdict::Exited.into_outcome(Some(ExitStatus::from_raw(0)));
        assert!(outcome.error().unwrap().message.contains("exit status: 0"));

        let outcome: Outcome<u32> =
            Verdict::Malformed("zero-length frame".into()).into_outcome(None);
        assert_eq!(outcome.error().unwrap().kind, FailureKind::Protocol);
    }

    #[test]
    fn test_supervisor_side_kind_from_worker_rejected() {
        let forged = WorkerMessage::failure(FailureKind::Crashed, "not mine to say");
        let outcome: Outcome<u32> = Verdict::from_report(forged).into_outcome(None);
        let error = outcome.error().unwrap();
        assert_eq!(error.kind, FailureKind::Protocol);
        assert!(error.message.contains("crashed"), "{}", error.message);

        let raised = WorkerMessage::failure(FailureKind::Raised, "bad target");
        assert!(matches!(Verdict::from_report(raised), Verdict::Reported(_)));
    }

    #[cfg(target_os = "linux")]
    fn is_gone(pid: u32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let state = std::fs::read_to_string(format!("/proc/{}/stat", pid))
                .ok()
                .and_then(|stat| {
                    let (_, rest) = stat.rsplit_once(')')?;
                    rest.split_whitespace().next().map(str::to_owned)
                });
            // A zombie no longer runs
            if state.map_or(true, |s| s == "Z" || s == "X") {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_helper_in_own_group_killed_after_report() {
        use std::os::unix::process::CommandExt;

        let task = Task::new(
            |_: &DeviceContext, _: &Args| -> anyhow::Result<u32> {
                let helper = std::process::Command::new("sleep")
                    .arg("30")
                    .process_group(0)
                    .spawn()?;
                Ok(helper.id())
            },
            "llvm",
            Args::new(),
        );
        let outcome = supervisor(Duration::from_secs(5))
            .run(6, task)
            .recv(None)
            .unwrap();
        let helper = *outcome.value().unwrap();
        assert!(is_gone(helper), "helper {} outlived its worker", helper);
    }

    #[test]
    fn test_panic_backtrace_points_at_panic_site() {
        #[inline(never)]
        fn overflowing_kernel() -> anyhow::Result<u32> {
            panic!("index out of range")
        }

        let task = Task::new(
            |_: &DeviceContext, _: &Args| {
                // Only this worker process sees the variable
                std::env::set_var("RUST_LIB_BACKTRACE", "1");
                overflowing_kernel()
            },
            "llvm",
            Args::new(),
        );
        let outcome = supervisor(Duration::from_secs(10))
            .run(7, task)
            .recv(None)
            .unwrap();
        let error = outcome.error().unwrap();
        assert_eq!(error.kind, FailureKind::Panic);
        let backtrace = error.backtrace.as_deref().unwrap_or_default();
        assert!(backtrace.contains("overflowing_kernel"), "{}", backtrace);
    }
}
