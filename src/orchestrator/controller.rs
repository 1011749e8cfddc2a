//! Scheduler lifecycle controller.
//!
//! Owns the scheduler state and the single worker handle, and serializes
//! start/stop against each other. Status queries read a shared snapshot and are
//! never blocked behind a running proposal or a pending stop.

use crate::engine::{SharedSnapshot, Snapshot, Worker};
use crate::error::SchedulerError;
use crate::executor::Executor;
use crate::model::{
    FailurePolicy, Pid, SchedulerEvent, SchedulerState, StartOutcome, WorkerExit, WorkerReport,
};
use crate::source::ProposalSource;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{mpsc::UnboundedSender, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Internal handle for a running worker task.
struct RunCtx {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<WorkerReport>,
}

/// Wires collaborators into a [`Controller`].
#[derive(Default)]
pub struct ControllerBuilder {
    source: Option<Arc<dyn ProposalSource>>,
    executor: Option<Arc<dyn Executor>>,
    policy: FailurePolicy,
    event_tx: Option<UnboundedSender<SchedulerEvent>>,
}

impl ControllerBuilder {
    pub fn source(mut self, source: Arc<dyn ProposalSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Forward worker events to `tx`. Send errors are ignored.
    pub fn events(mut self, tx: UnboundedSender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Missing collaborators are not an error here; `start()` reports them.
    pub fn build(self) -> Controller {
        Controller {
            source: self.source,
            executor: self.executor,
            policy: self.policy,
            event_tx: self.event_tx,
            snapshot: SharedSnapshot::new(),
            run: Mutex::new(None),
        }
    }
}

pub struct Controller {
    source: Option<Arc<dyn ProposalSource>>,
    executor: Option<Arc<dyn Executor>>,
    policy: FailurePolicy,
    event_tx: Option<UnboundedSender<SchedulerEvent>>,
    snapshot: SharedSnapshot,
    run: Mutex<Option<RunCtx>>,
}

impl Controller {
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::default()
    }

    /// Fetch the batch and spawn a worker for it.
    ///
    /// An empty batch is a no-op: no worker is spawned and the scheduler stays
    /// idle. When a worker is spawned this returns only after the first
    /// proposal has been published as current.
    pub async fn start(&self) -> Result<StartOutcome, SchedulerError> {
        let (source, executor) = self.collaborators()?;

        let mut run = self.run.lock().await;
        self.reap_finished(&mut run).await;
        if run.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let proposals = source.get_proposals().await.map_err(|e| {
            SchedulerError::InitializationFailure(format!("failed to fetch proposals: {e:#}"))
        })?;
        if proposals.is_empty() {
            info!("no proposals to run");
            return Ok(StartOutcome::NothingToRun);
        }

        let queued = proposals.len();
        let stop = Arc::new(AtomicBool::new(false));
        *self.snapshot.write() = Snapshot {
            state: SchedulerState::Running,
            ..Snapshot::IDLE
        };
        let worker = Worker {
            proposals,
            executor,
            source,
            snapshot: self.snapshot.clone(),
            stop: stop.clone(),
            policy: self.policy,
            event_tx: self.event_tx.clone(),
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(worker.run(ready_tx));
        *run = Some(RunCtx { stop, handle });

        // Err means the worker terminated before publishing anything.
        let _ = ready_rx.await;
        info!(queued, "scheduler started");
        Ok(StartOutcome::Started { queued })
    }

    /// Ask the worker to stop after its current proposal and wait for it.
    ///
    /// There is no timeout. Concurrent callers queue up behind the first; once
    /// it returns they observe [`SchedulerError::AlreadyStopped`]. Dropping the
    /// returned future leaves the worker registered as stop-requested and a
    /// later call resumes the wait.
    pub async fn stop(&self) -> Result<WorkerReport, SchedulerError> {
        let mut run = self.run.lock().await;
        let Some(ctx) = run.as_mut() else {
            return Err(SchedulerError::AlreadyStopped);
        };

        let snap = self.snapshot.get();
        if snap.state == SchedulerState::Running && snap.worker_done && !snap.worker_aborted {
            // Ran out on its own; nothing left to stop.
            self.reap_finished(&mut run).await;
            return Err(SchedulerError::AlreadyStopped);
        }
        // A worker that died part way is still reaped here and reported with
        // an empty report.

        ctx.stop.store(true, Ordering::Release);
        self.snapshot.write().state = SchedulerState::StopRequested;
        info!(current = ?snap.current, "stop requested, waiting for worker");

        let report = join_worker(&mut ctx.handle).await;
        *run = None;
        *self.snapshot.write() = Snapshot::IDLE;
        info!(
            executed = report.executed,
            skipped = report.skipped,
            "scheduler stopped"
        );
        Ok(report)
    }

    /// Identifier of the proposal the worker is executing right now.
    pub fn proposal_under_execution(&self) -> Result<Pid, SchedulerError> {
        let snap = self.snapshot.get();
        match (snap.state, snap.current) {
            (SchedulerState::Idle, _) | (_, None) => Err(SchedulerError::NoProposalExecuting),
            (_, Some(pid)) => Ok(pid),
        }
    }

    /// Current scheduler state. A worker that ran out on its own, or died,
    /// reports `Idle` even before the controller has reaped it.
    pub fn state(&self) -> SchedulerState {
        let snap = self.snapshot.get();
        if snap.worker_done && snap.state == SchedulerState::Running {
            SchedulerState::Idle
        } else {
            snap.state
        }
    }

    fn collaborators(
        &self,
    ) -> Result<(Arc<dyn ProposalSource>, Arc<dyn Executor>), SchedulerError> {
        match (&self.source, &self.executor) {
            (Some(s), Some(e)) => Ok((s.clone(), e.clone())),
            (None, _) => Err(SchedulerError::InitializationFailure(
                "proposal source unavailable".into(),
            )),
            (_, None) => Err(SchedulerError::InitializationFailure(
                "executor unavailable".into(),
            )),
        }
    }

    /// Drop a worker that terminated without an explicit stop.
    async fn reap_finished(&self, run: &mut Option<RunCtx>) {
        let finished = match run.as_ref() {
            Some(ctx) => self.snapshot.read().worker_done || ctx.handle.is_finished(),
            None => false,
        };
        if !finished {
            return;
        }
        if let Some(mut ctx) = run.take() {
            let report = join_worker(&mut ctx.handle).await;
            *self.snapshot.write() = Snapshot::IDLE;
            info!(exit = ?report.exit, executed = report.executed, "worker reaped");
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        // The task outlives its JoinHandle; let it drain instead of running on.
        if let Some(ctx) = self.run.get_mut().as_ref() {
            ctx.stop.store(true, Ordering::Release);
        }
    }
}

async fn join_worker(handle: &mut JoinHandle<WorkerReport>) -> WorkerReport {
    match handle.await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "worker task failed");
            WorkerReport::empty(WorkerExit::Drained)
        }
    }
}
