//! Run Reports
//!
//! Collects the outcomes of repeated command runs into a serializable report
//! with a summary of successes, failures, timeouts and timing.

use isorun_core::Outcome;
use serde::{Deserialize, Serialize};

/// One submission and its outcome (elapsed seconds on success)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// 1-based run number
    pub run: usize,
    /// Executor-assigned task id
    pub task_id: u64,
    /// Terminal outcome
    pub outcome: Outcome<f64>,
}

/// Aggregate over all runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Number of runs
    pub total: usize,
    /// Runs that returned a time
    pub successes: usize,
    /// Runs that failed (non-zero exit, crash, spawn failure, ...)
    pub failures: usize,
    /// Runs killed at the deadline
    pub timeouts: usize,
    /// Mean elapsed seconds over successful runs
    pub mean_secs: Option<f64>,
    /// Fastest successful run
    pub best_secs: Option<f64>,
}

impl RunSummary {
    /// Summarize `runs`
    pub fn from_runs(runs: &[RunRecord]) -> Self {
        let times: Vec<f64> = runs
            .iter()
            .filter_map(|r| r.outcome.value().copied())
            .collect();
        let timeouts = runs.iter().filter(|r| r.outcome.is_timed_out()).count();

        let mean_secs = if times.is_empty() {
            None
        } else {
            Some(times.iter().sum::<f64>() / times.len() as f64)
        };
        let best_secs = times.iter().copied().reduce(f64::min);

        Self {
            total: runs.len(),
            successes: times.len(),
            failures: runs.len() - times.len() - timeouts,
            timeouts,
            mean_secs,
            best_secs,
        }
    }

    /// Whether every run succeeded
    pub fn all_succeeded(&self) -> bool {
        self.successes == self.total
    }
}

/// Complete report for one CLI invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Command line that was timed
    pub command: Vec<String>,
    /// Target descriptor
    pub target: String,
    /// Per-run deadline in milliseconds
    pub timeout_ms: u64,
    /// Submission policy
    pub policy: String,
    /// Whether runs were process-isolated
    pub isolated: bool,
    /// Individual runs in submission order
    pub runs: Vec<RunRecord>,
    /// Aggregate
    pub summary: RunSummary,
}

/// Build a report from the collected runs
pub fn build_report(
    command: &[String],
    target: &str,
    timeout_ms: u64,
    policy: &str,
    isolated: bool,
    runs: Vec<RunRecord>,
) -> RunReport {
    let summary = RunSummary::from_runs(&runs);
    RunReport {
        command: command.to_vec(),
        target: target.to_string(),
        timeout_ms,
        policy: policy.to_string(),
        isolated,
        runs,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isorun_core::{FailureKind, TaskError};

    fn record(run: usize, outcome: Outcome<f64>) -> RunRecord {
        RunRecord {
            run,
            task_id: run as u64,
            outcome,
        }
    }

    #[test]
    fn test_summary_counts() {
        let runs = vec![
            record(1, Outcome::Success(0.5)),
            record(2, Outcome::TimedOut),
            record(3, Outcome::Success(0.25)),
            record(
                4,
                Outcome::Failure(TaskError::new(FailureKind::Raised, "exit status: 1")),
            ),
        ];
        let summary = RunSummary::from_runs(&runs);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.successes, 2);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.timeouts, 1);
        assert_eq!(summary.mean_secs, Some(0.375));
        assert_eq!(summary.best_secs, Some(0.25));
        assert!(!summary.all_succeeded());
    }

    #[test]
    fn test_summary_without_successes() {
        let summary = RunSummary::from_runs(&[record(1, Outcome::TimedOut)]);
        assert_eq!(summary.mean_secs, None);
        assert_eq!(summary.best_secs, None);
    }

    #[test]
    fn test_report_json_shape() {
        let report = build_report(
            &["true".to_string()],
            "llvm",
            1000,
            "pooled",
            true,
            vec![record(1, Outcome::Success(0.01))],
        );
        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["runs"][0]["outcome"]["status"], "success");
        assert_eq!(json["summary"]["successes"], 1);
        assert_eq!(json["target"], "llvm");
    }
}
