//! Run summary for CLI output.
//!
//! Collects what the worker reported over a run and formats it as text lines or
//! JSON.

use crate::metrics;
use crate::model::{ExecutionOutcome, WorkerExit, WorkerReport};
use serde::Serialize;

/// Everything the CLI learned about one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub queued: usize,
    pub outcomes: Vec<ExecutionOutcome>,
    pub report: Option<WorkerReport>,
}

impl RunSummary {
    pub fn new(queued: usize) -> Self {
        Self {
            queued,
            ..Default::default()
        }
    }
}

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

pub(crate) fn build_text_summary(summary: &RunSummary) -> TextSummary {
    let mut lines = Vec::new();

    if summary.queued == 0 {
        lines.push("No queued proposals.".to_string());
        return TextSummary { lines };
    }

    let ok = summary.outcomes.iter().filter(|o| o.ok).count();
    let failed = summary.outcomes.len() - ok;
    let skipped = summary.report.map(|r| r.skipped).unwrap_or(0);
    lines.push(format!(
        "Proposals: {} queued, {} succeeded, {} failed, {} skipped",
        summary.queued, ok, failed, skipped
    ));

    match summary.report.map(|r| r.exit) {
        Some(WorkerExit::Exhausted) => lines.push("Worker: ran to completion".to_string()),
        Some(WorkerExit::Drained) => lines.push("Worker: stopped early".to_string()),
        None => lines.push("Worker: no final report".to_string()),
    }

    let secs: Vec<f64> = summary
        .outcomes
        .iter()
        .map(|o| o.elapsed.as_secs_f64())
        .collect();
    if let Some((mean, median, p25, p75)) = metrics::compute_metrics(&secs) {
        lines.push(format!(
            "Execution time: avg {:.2}s med {:.2}s p25 {:.2}s p75 {:.2}s",
            mean, median, p25, p75
        ));
    }

    for o in summary.outcomes.iter().filter(|o| !o.ok) {
        lines.push(format!(
            "  {} failed: {}",
            o.pid,
            o.error.as_deref().unwrap_or("-")
        ));
    }

    TextSummary { lines }
}
