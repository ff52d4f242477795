//! Task Future
//!
//! The handle a caller holds for a submitted task. The first successful
//! retrieval caches the outcome and releases the channel; every later call
//! returns the cached value.

use crate::channel::{OutcomeReceiver, RetrievalError};
use crate::outcome::Outcome;
use std::fmt;
use std::time::Duration;

/// Caller-held handle for retrieving one task's outcome
pub struct TaskFuture<T> {
    task_id: u64,
    receiver: Option<OutcomeReceiver<T>>,
    outcome: Option<Outcome<T>>,
}

impl<T> TaskFuture<T> {
    /// Wrap the read side of a result channel
    pub fn new(task_id: u64, receiver: OutcomeReceiver<T>) -> Self {
        Self {
            task_id,
            receiver: Some(receiver),
            outcome: None,
        }
    }

    /// A future whose outcome is already known
    pub fn ready(task_id: u64, outcome: Outcome<T>) -> Self {
        Self {
            task_id,
            receiver: None,
            outcome: Some(outcome),
        }
    }

    /// Executor-assigned task number
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// Retrieve the outcome, waiting up to `wait` (forever if `None`).
    ///
    /// A [`RetrievalError::TimedOut`] only means the caller stopped waiting;
    /// the future stays usable and a later call can still succeed.
    pub fn get(&mut self, wait: Option<Duration>) -> Result<&Outcome<T>, RetrievalError> {
        if self.outcome.is_none() {
            let receiver = self
                .receiver
                .as_ref()
                .ok_or(RetrievalError::Disconnected)?;
            let outcome = receiver.recv(wait)?;
            self.settle(outcome);
        }

        self.outcome.as_ref().ok_or(RetrievalError::Disconnected)
    }

    /// Whether an outcome is cached or can be taken without blocking.
    pub fn done(&mut self) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        let polled = self.receiver.as_ref().map(OutcomeReceiver::try_recv);
        match polled {
            Some(Ok(Some(outcome))) => {
                self.settle(outcome);
                true
            }
            _ => false,
        }
    }

    /// Retrieve the outcome and consume the future
    pub fn into_outcome(mut self, wait: Option<Duration>) -> Result<Outcome<T>, RetrievalError> {
        self.get(wait)?;
        self.outcome.take().ok_or(RetrievalError::Disconnected)
    }

    fn settle(&mut self, outcome: Outcome<T>) {
        self.outcome = Some(outcome);
        // Exactly one read per task; release the channel
        self.receiver = None;
    }
}

impl<T> fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture")
            .field("task_id", &self.task_id)
            .field("state", &self.outcome.as_ref().map_or("pending", Outcome::label))
            .finish()
    }
}
