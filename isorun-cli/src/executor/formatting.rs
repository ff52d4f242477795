//! Output Formatting
//!
//! Human-readable output for run reports: one line per run with a status
//! icon (✓/✗/⏱), followed by a summary block.

use super::report::RunReport;
use isorun_core::Outcome;

/// Format a report for human-readable terminal display
pub fn format_human_output(report: &RunReport) -> String {
    let mut output = String::new();

    output.push('\n');
    output.push_str("isorun Results\n");
    output.push_str(&"=".repeat(60));
    output.push_str("\n\n");

    output.push_str(&format!("Command: {}\n", report.command.join(" ")));
    output.push_str(&format!(
        "Target: {}  timeout: {} ms  policy: {}{}\n",
        report.target,
        report.timeout_ms,
        report.policy,
        if report.isolated { "" } else { " (in-process)" }
    ));
    output.push_str(&"-".repeat(60));
    output.push('\n');

    for record in &report.runs {
        match &record.outcome {
            Outcome::Success(secs) => {
                output.push_str(&format!("  ✓ run {:<4} {}\n", record.run, format_secs(*secs)));
            }
            Outcome::Failure(error) => {
                output.push_str(&format!("  ✗ run {:<4} {}\n", record.run, error.kind));
                output.push_str(&format!("      error: {}\n", error.message));
            }
            Outcome::TimedOut => {
                output.push_str(&format!("  ⏱ run {:<4} timed out\n", record.run));
            }
        }
    }

    let summary = &report.summary;
    output.push('\n');
    output.push_str("Summary\n");
    output.push_str(&"-".repeat(60));
    output.push('\n');
    output.push_str(&format!(
        "  Total: {}  Succeeded: {}  Failed: {}  Timed out: {}\n",
        summary.total, summary.successes, summary.failures, summary.timeouts
    ));
    if let (Some(mean), Some(best)) = (summary.mean_secs, summary.best_secs) {
        output.push_str(&format!(
            "  mean: {}  best: {}\n",
            format_secs(mean),
            format_secs(best)
        ));
    }

    output
}

/// Pick a readable unit for a duration in seconds
fn format_secs(secs: f64) -> String {
    if secs >= 1.0 {
        format!("{:.3} s", secs)
    } else if secs >= 1e-3 {
        format!("{:.3} ms", secs * 1e3)
    } else {
        format!("{:.3} us", secs * 1e6)
    }
}
