//! Result Channel
//!
//! A bounded FIFO that carries a task's terminal [`Outcome`] to its future.
//! Several parties may try to post (the relayed worker report, the deadline
//! sentinel, a crash report). Posting goes through a single atomic claim, so
//! the first poster wins and every later post is discarded before it reaches
//! the queue. Delivery never depends on the enqueue order of competing writers.

use crate::outcome::Outcome;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Queue capacity. Two slots let a late second write complete without
/// blocking its producer even if the claim were bypassed.
pub const RESULT_CHANNEL_CAPACITY: usize = 2;

/// Errors returned while waiting for an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RetrievalError {
    /// Nothing arrived within the caller's wait timeout. The task itself may
    /// still be running; a later retrieval can succeed.
    #[error("no outcome available after waiting {waited:?}")]
    TimedOut {
        /// How long the caller waited
        waited: Duration,
    },

    /// Every poster was dropped without posting an outcome
    #[error("result channel closed without an outcome")]
    Disconnected,
}

/// Create a result channel
pub fn result_channel<T>() -> (OutcomePoster<T>, OutcomeReceiver<T>) {
    let (sender, receiver) = mpsc::sync_channel(RESULT_CHANNEL_CAPACITY);
    let poster = OutcomePoster {
        sender,
        claimed: Arc::new(AtomicBool::new(false)),
    };
    (poster, OutcomeReceiver { receiver })
}

/// Write side of a result channel. Clones share one claim.
pub struct OutcomePoster<T> {
    sender: SyncSender<Outcome<T>>,
    claimed: Arc<AtomicBool>,
}

impl<T> Clone for OutcomePoster<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            claimed: Arc::clone(&self.claimed),
        }
    }
}

impl<T> OutcomePoster<T> {
    /// Post `outcome` if no outcome has been claimed yet.
    ///
    /// Returns `true` if this call won the claim and the outcome was enqueued.
    /// A dropped receiver still counts as a won claim that delivered nothing,
    /// and returns `false`.
    pub fn post(&self, outcome: Outcome<T>) -> bool {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(
                discarded = outcome.label(),
                "outcome already claimed; discarding"
            );
            return false;
        }

        match self.sender.try_send(outcome) {
            Ok(()) => true,
            Err(TrySendError::Disconnected(outcome)) => {
                tracing::debug!(
                    outcome = outcome.label(),
                    "future dropped before outcome was posted"
                );
                false
            }
            Err(TrySendError::Full(_)) => {
                // Unreachable while the claim holds: at most one item is ever sent.
                tracing::warn!("result channel full; outcome dropped");
                false
            }
        }
    }

    /// Whether some poster already claimed the outcome
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

/// Read side of a result channel
pub struct OutcomeReceiver<T> {
    receiver: Receiver<Outcome<T>>,
}

impl<T> OutcomeReceiver<T> {
    /// Block until an outcome arrives, or up to `wait` when given.
    pub fn recv(&self, wait: Option<Duration>) -> Result<Outcome<T>, RetrievalError> {
        match wait {
            None => self.receiver.recv().map_err(|_| RetrievalError::Disconnected),
            Some(waited) => self.receiver.recv_timeout(waited).map_err(|e| match e {
                RecvTimeoutError::Timeout => RetrievalError::TimedOut { waited },
                RecvTimeoutError::Disconnected => RetrievalError::Disconnected,
            }),
        }
    }

    /// Take an outcome if one is already queued.
    pub fn try_recv(&self) -> Result<Option<Outcome<T>>, RetrievalError> {
        match self.receiver.try_recv() {
            Ok(outcome) => Ok(Some(outcome)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(RetrievalError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::TaskError;
    use isorun_ipc::FailureKind;
    use std::thread;

    #[test]
    fn test_first_writer_wins() {
        let (poster, receiver) = result_channel::<u32>();
        let sentinel = poster.clone();

        assert!(poster.post(Outcome::Success(42)));
        assert!(!sentinel.post(Outcome::TimedOut));
        assert!(sentinel.is_claimed());

        assert_eq!(receiver.recv(None).unwrap(), Outcome::Success(42));
        // The losing post never reached the queue
        assert_eq!(receiver.try_recv().unwrap(), None);
    }

    #[test]
    fn test_racing_posters_deliver_exactly_one() {
        for _ in 0..50 {
            let (poster, receiver) = result_channel::<u32>();
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let poster = poster.clone();
                    thread::spawn(move || {
                        if i % 2 == 0 {
                            poster.post(Outcome::Success(i))
                        } else {
                            poster.post(Outcome::TimedOut)
                        }
                    })
                })
                .collect();

            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);

            drop(poster);
            assert!(receiver.recv(Some(Duration::from_secs(1))).is_ok());
            assert_eq!(receiver.recv(None), Err(RetrievalError::Disconnected));
        }
    }

    #[test]
    fn test_recv_timeout_is_retrieval_error() {
        let (_poster, receiver) = result_channel::<u32>();
        let err = receiver.recv(Some(Duration::from_millis(10))).unwrap_err();
        assert_eq!(
            err,
            RetrievalError::TimedOut {
                waited: Duration::from_millis(10)
            }
        );
    }

    #[test]
    fn test_disconnected_without_post() {
        let (poster, receiver) = result_channel::<u32>();
        drop(poster);
        assert_eq!(receiver.recv(None), Err(RetrievalError::Disconnected));
    }

    #[test]
    fn test_post_after_receiver_dropped() {
        let (poster, receiver) = result_channel::<u32>();
        drop(receiver);
        let failure = Outcome::Failure(TaskError::new(FailureKind::Raised, "late"));
        assert!(!poster.post(failure));
        assert!(poster.is_claimed());
    }
}
