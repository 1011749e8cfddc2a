use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Proposal identifier.
pub type Pid = i64;

/// Horizontal coordinates a target is observed at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub az: f64,
    pub el: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub tid: i64,
    pub coordinates: Position,
    #[serde(with = "humantime_serde")]
    pub exp_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    #[default]
    Queued,
    Running,
    Ready,
    Failed,
}

/// One unit of schedulable observation work.
///
/// The scheduler only cares about `pid`; targets are consumed by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub pid: Pid,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub status: ProposalStatus,
}

impl Proposal {
    /// Proposal with no targets, mostly useful for tests and demos.
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            targets: Vec::new(),
            status: ProposalStatus::Queued,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    Idle,
    Running,
    StopRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerPhase {
    Starting,
    Iterating,
    /// Stop signal observed; no further proposal will start.
    Draining,
    /// Sequence ran out naturally.
    Exhausted,
    Terminated,
}

/// How a worker left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerExit {
    Exhausted,
    Drained,
}

/// What to do with the rest of the batch once a proposal fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Log and move on to the next proposal.
    #[default]
    Continue,
    /// Drain the worker as if a stop had been requested.
    StopBatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub pid: Pid,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub finished_at_utc: String,
}

/// Summary returned by a worker when it terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub exit: WorkerExit,
    pub executed: usize,
    pub failed: usize,
    /// Proposals that never started because the worker drained first.
    pub skipped: usize,
}

impl WorkerReport {
    pub(crate) fn empty(exit: WorkerExit) -> Self {
        Self {
            exit,
            executed: 0,
            failed: 0,
            skipped: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerEvent {
    Phase(WorkerPhase),
    ProposalStarted { pid: Pid },
    ProposalFinished(ExecutionOutcome),
    WorkerFinished(WorkerReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { queued: usize },
    /// The source returned no proposals; no worker was spawned.
    NothingToRun,
}
