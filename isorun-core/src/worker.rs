//! Worker Side
//!
//! Runs a [`Task`] and reports its result. [`execute`] does the work and never
//! panics or returns an error; it is shared by the forked worker and by
//! in-process execution. [`WorkerMain`] writes the single report frame that a
//! forked worker sends back before it exits.

use crate::device::DeviceResolver;
use crate::task::{Args, Task};
use isorun_ipc::{FailureKind, FrameError, FrameWriter, WORKER_EXIT_REPORT_FAILED, WorkerMessage};
use serde::Serialize;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::io::Write;
use std::sync::Once;

thread_local! {
    /// Backtrace taken by the panic hook on the panicking thread
    static PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static BACKTRACE_HOOK: Once = Once::new();

/// Same switches the standard library uses, read at panic time so a worker can
/// turn them on after fork.
fn backtrace_enabled() -> bool {
    std::env::var_os("RUST_LIB_BACKTRACE")
        .or_else(|| std::env::var_os("RUST_BACKTRACE"))
        .map_or(false, |value| value != "0")
}

/// Chain a panic hook that records the backtrace at the panic site. By the
/// time `catch_unwind` returns, the frames that panicked are gone.
fn install_backtrace_hook() {
    BACKTRACE_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if backtrace_enabled() {
                let backtrace = Backtrace::force_capture().to_string();
                PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            }
            previous(info);
        }));
    });
}

fn take_panic_backtrace() -> Option<String> {
    PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

/// Resolve the task's context, run it, and capture the result as a message.
///
/// Context errors, returned errors and panics all become
/// [`WorkerMessage::Failure`]; nothing escapes to the caller.
pub fn execute<R, F, T>(resolver: &R, task: Task<F>) -> WorkerMessage
where
    R: DeviceResolver,
    F: FnOnce(&R::Context, &Args) -> anyhow::Result<T>,
    T: Serialize,
{
    let Task {
        function,
        target,
        args,
    } = task;

    install_backtrace_hook();
    take_panic_backtrace();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let context = match resolver.resolve(&target) {
            Ok(context) => context,
            Err(e) => return Err((FailureKind::Context, e)),
        };
        function(&context, &args).map_err(|e| (FailureKind::Raised, e))
    }));

    match result {
        Ok(Ok(value)) => match serde_json::to_vec(&value) {
            Ok(payload) => WorkerMessage::Success { payload },
            Err(e) => WorkerMessage::failure(
                FailureKind::Encode,
                format!("failed to serialize result: {}", e),
            ),
        },
        // {:#} keeps anyhow's context chain on one line
        Ok(Err((kind, e))) => WorkerMessage::failure(kind, format!("{:#}", e)),
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };

            WorkerMessage::Failure {
                kind: FailureKind::Panic,
                message,
                backtrace: take_panic_backtrace(),
            }
        }
    }
}

/// Reporting end of a forked worker
pub struct WorkerMain<W: Write> {
    writer: FrameWriter<W>,
}

impl<W: Write> WorkerMain<W> {
    /// Create a worker that reports on `writer` (the pipe to the supervisor)
    pub fn new(writer: W) -> Self {
        Self {
            writer: FrameWriter::new(writer),
        }
    }

    /// Run the task and report its outcome. Returns the process exit code.
    pub fn run<R, F, T>(mut self, resolver: &R, task: Task<F>) -> i32
    where
        R: DeviceResolver,
        F: FnOnce(&R::Context, &Args) -> anyhow::Result<T>,
        T: Serialize,
    {
        let message = execute(resolver, task);
        let written = match self.writer.write(&message) {
            // Nothing reached the pipe yet; report the oversized result instead
            Err(FrameError::FrameTooLarge { size, max }) => {
                let fallback = WorkerMessage::failure(
                    FailureKind::Encode,
                    format!("result of {} bytes exceeds the {} byte frame limit", size, max),
                );
                self.writer.write(&fallback)
            }
            other => other,
        };
        match written {
            Ok(()) => 0,
            Err(_) => WORKER_EXIT_REPORT_FAILED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceContext, HostDevices};
    use crate::outcome::Outcome;
    use anyhow::bail;
    use isorun_ipc::FrameBuffer;

    fn run_inline<T, F>(target: &str, f: F) -> WorkerMessage
    where
        T: Serialize,
        F: FnOnce(&DeviceContext, &Args) -> anyhow::Result<T>,
    {
        execute(&HostDevices, Task::new(f, target, Args::new().arg(20)))
    }

    #[test]
    fn test_success_serializes_value() {
        let message = run_inline("llvm", |_, args| {
            Ok(args.get(0).and_then(|v| v.as_u64()).unwrap_or(0) + 22)
        });
        assert_eq!(
            Outcome::<u64>::from_message(message),
            Outcome::Success(42)
        );
    }

    #[test]
    fn test_raised_error_is_captured() {
        let message = run_inline::<u64, _>("llvm", |_, _| bail!("bad target"));
        match message {
            WorkerMessage::Failure { kind, message, .. } => {
                assert_eq!(kind, FailureKind::Raised);
                assert_eq!(message, "bad target");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_error_context_chain_kept() {
        let message = run_inline::<u64, _>("llvm", |_, _| {
            Err(anyhow::anyhow!("device busy")).map_err(|e| e.context("while timing kernel"))
        });
        match message {
            WorkerMessage::Failure { message, .. } => {
                assert_eq!(message, "while timing kernel: device busy");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_device_is_context_failure() {
        let mut called = false;
        let message = run_inline("cuda", |_, _| {
            called = true;
            Ok(1u8)
        });
        assert!(!called);
        match message {
            WorkerMessage::Failure { kind, message, .. } => {
                assert_eq!(kind, FailureKind::Context);
                assert!(message.contains("cuda"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_panic_is_captured() {
        let message = run_inline::<u64, _>("llvm", |_, _| panic!("kernel exploded"));
        match message {
            WorkerMessage::Failure { kind, message, .. } => {
                assert_eq!(kind, FailureKind::Panic);
                assert_eq!(message, "kernel exploded");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_panic_backtrace_not_reused() {
        PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some("stale".to_string()));
        let message = run_inline::<u64, _>("llvm", |_, _| bail!("bad target"));
        assert!(matches!(message, WorkerMessage::Failure { .. }));
        assert_eq!(take_panic_backtrace(), None);
    }

    #[test]
    fn test_oversized_result_reported_as_encode_failure() {
        let mut pipe = Vec::new();
        let code = WorkerMain::new(&mut pipe).run(
            &HostDevices,
            Task::new(
                |_: &DeviceContext, _: &Args| Ok("x".repeat(isorun_ipc::MAX_FRAME_SIZE)),
                "cpu",
                Args::new(),
            ),
        );
        assert_eq!(code, 0);

        let mut frames = FrameBuffer::new();
        frames.extend(&pipe);
        let message: WorkerMessage = frames.try_decode().unwrap().unwrap();
        match message {
            WorkerMessage::Failure { kind, .. } => assert_eq!(kind, FailureKind::Encode),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_worker_main_writes_one_frame() {
        let mut pipe = Vec::new();
        let code = WorkerMain::new(&mut pipe).run(
            &HostDevices,
            Task::new(|ctx: &DeviceContext, _: &Args| Ok(ctx.index), "cpu", Args::new()),
        );
        assert_eq!(code, 0);

        let mut frames = FrameBuffer::new();
        frames.extend(&pipe);
        let message: WorkerMessage = frames.try_decode().unwrap().unwrap();
        assert_eq!(Outcome::<u32>::from_message(message), Outcome::Success(0));
        assert!(frames.is_empty());
    }
}
