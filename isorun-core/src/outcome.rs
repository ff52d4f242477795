//! Task Outcomes
//!
//! Every task ends in exactly one [`Outcome`]. Errors raised by the measured
//! code are carried as data in [`TaskError`] instead of being re-raised, so a
//! batch of tasks can be evaluated without one failure aborting it.

use isorun_ipc::{FailureKind, WorkerMessage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error captured from a task (or from its worker process)
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct TaskError {
    /// Failure category
    pub kind: FailureKind,
    /// Human-readable message, including the cause chain
    pub message: String,
    /// Backtrace captured in the worker, if enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
}

impl TaskError {
    /// Create an error without a backtrace
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            backtrace: None,
        }
    }
}

/// Terminal result of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "kebab-case")]
pub enum Outcome<T> {
    /// The function returned normally
    Success(T),
    /// The function (or its worker) failed
    Failure(TaskError),
    /// The task exceeded its wall-clock budget and was killed
    TimedOut,
}

impl<T> Outcome<T> {
    /// Whether the task succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Whether the task was killed at its deadline
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Outcome::TimedOut)
    }

    /// The success value, if any
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Success(value) => Some(value),
            _ => None,
        }
    }

    /// The captured error, if any
    pub fn error(&self) -> Option<&TaskError> {
        match self {
            Outcome::Failure(error) => Some(error),
            _ => None,
        }
    }

    /// Map the success value
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success(value) => Outcome::Success(f(value)),
            Outcome::Failure(error) => Outcome::Failure(error),
            Outcome::TimedOut => Outcome::TimedOut,
        }
    }

    /// Short status label: `success`, `failure` or `timed-out`
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Failure(_) => "failure",
            Outcome::TimedOut => "timed-out",
        }
    }
}

impl<T: DeserializeOwned> Outcome<T> {
    /// Convert a worker's report into an outcome, decoding the JSON payload.
    pub fn from_message(message: WorkerMessage) -> Self {
        match message {
            WorkerMessage::Success { payload } => match serde_json::from_slice(&payload) {
                Ok(value) => Outcome::Success(value),
                Err(e) => Outcome::Failure(TaskError::new(
                    FailureKind::Protocol,
                    format!("undecodable result payload: {}", e),
                )),
            },
            WorkerMessage::Failure {
                kind,
                message,
                backtrace,
            } => Outcome::Failure(TaskError {
                kind,
                message,
                backtrace,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_from_message() {
        let message = WorkerMessage::Success {
            payload: serde_json::to_vec(&42u32).unwrap(),
        };
        let outcome: Outcome<u32> = Outcome::from_message(message);
        assert_eq!(outcome, Outcome::Success(42));
        assert_eq!(outcome.value(), Some(&42));
        assert_eq!(outcome.label(), "success");
    }

    #[test]
    fn test_failure_from_message() {
        let message = WorkerMessage::failure(FailureKind::Raised, "bad target");
        let outcome: Outcome<u32> = Outcome::from_message(message);
        let error = outcome.error().unwrap();
        assert_eq!(error.kind, FailureKind::Raised);
        assert_eq!(error.message, "bad target");
        assert_eq!(error.to_string(), "raised: bad target");
    }

    #[test]
    fn test_payload_type_mismatch_is_protocol_failure() {
        let message = WorkerMessage::Success {
            payload: serde_json::to_vec("not a number").unwrap(),
        };
        let outcome: Outcome<u32> = Outcome::from_message(message);
        assert_eq!(outcome.error().unwrap().kind, FailureKind::Protocol);
    }

    #[test]
    fn test_map_preserves_non_success() {
        let timed_out: Outcome<u32> = Outcome::TimedOut;
        assert!(timed_out.map(|v| v * 2).is_timed_out());
        assert_eq!(Outcome::Success(2).map(|v: u32| v * 2), Outcome::Success(4));
    }

    #[test]
    fn test_outcome_json_shape() {
        let json = serde_json::to_value(Outcome::Success(1.5f64)).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["value"], 1.5);

        let json = serde_json::to_value(Outcome::<f64>::TimedOut).unwrap();
        assert_eq!(json["status"], "timed-out");
    }
}
