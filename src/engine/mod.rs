//! The background worker that drains a proposal batch.
//!
//! One worker runs one batch, strictly one proposal at a time. The stop signal
//! is checked between proposals only; a proposal that has started always runs
//! to completion.

use crate::executor::Executor;
use crate::model::{
    ExecutionOutcome, FailurePolicy, Pid, Proposal, ProposalStatus, SchedulerEvent,
    SchedulerState, WorkerExit, WorkerPhase, WorkerReport,
};
use crate::source::ProposalSource;
use anyhow::anyhow;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// State shared between the controller and its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub state: SchedulerState,
    pub current: Option<Pid>,
    /// Set by the worker as its last act.
    pub worker_done: bool,
    /// The worker task died before reaching the end of its loop.
    pub worker_aborted: bool,
}

impl Snapshot {
    pub(crate) const IDLE: Snapshot = Snapshot {
        state: SchedulerState::Idle,
        current: None,
        worker_done: false,
        worker_aborted: false,
    };
}

#[derive(Debug, Clone)]
pub(crate) struct SharedSnapshot(Arc<RwLock<Snapshot>>);

impl SharedSnapshot {
    pub(crate) fn new() -> Self {
        Self(Arc::new(RwLock::new(Snapshot::IDLE)))
    }

    // Snapshot is plain data; poison is ignored.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn get(&self) -> Snapshot {
        *self.read()
    }
}

/// Marks the worker as gone when dropped, whether `run` returned or the task
/// unwound or was aborted part way through.
struct CompletionGuard {
    snapshot: SharedSnapshot,
    finished: bool,
}

impl CompletionGuard {
    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let mut snap = self.snapshot.write();
        snap.current = None;
        snap.worker_done = true;
        snap.worker_aborted = !self.finished;
    }
}

pub(crate) struct Worker {
    pub proposals: Vec<Proposal>,
    pub executor: Arc<dyn Executor>,
    pub source: Arc<dyn ProposalSource>,
    pub snapshot: SharedSnapshot,
    pub stop: Arc<AtomicBool>,
    pub policy: FailurePolicy,
    pub event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl Worker {
    /// Run the batch to exhaustion or until the stop signal is observed.
    ///
    /// `ready` fires once the first proposal has been published as current,
    /// or is dropped if the worker terminates without starting any.
    pub(crate) async fn run(self, ready: oneshot::Sender<()>) -> WorkerReport {
        let guard = CompletionGuard {
            snapshot: self.snapshot.clone(),
            finished: false,
        };
        let mut ready = Some(ready);
        let total = self.proposals.len();
        let mut report = WorkerReport::empty(WorkerExit::Exhausted);

        self.emit(SchedulerEvent::Phase(WorkerPhase::Starting));
        info!(proposals = total, "worker started");
        self.emit(SchedulerEvent::Phase(WorkerPhase::Iterating));

        for (idx, proposal) in self.proposals.iter().enumerate() {
            if self.stop.load(Ordering::Acquire) {
                report.exit = WorkerExit::Drained;
                report.skipped = total - idx;
                info!(skipped = report.skipped, "stop observed, draining");
                self.emit(SchedulerEvent::Phase(WorkerPhase::Draining));
                break;
            }

            let pid = proposal.pid;
            self.snapshot.write().current = Some(pid);
            if let Some(tx) = ready.take() {
                let _ = tx.send(());
            }
            self.emit(SchedulerEvent::ProposalStarted { pid });
            self.report_status(pid, ProposalStatus::Running).await;

            let started = tokio::time::Instant::now();
            let result = match AssertUnwindSafe(self.executor.execute_observation(proposal))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(anyhow!("executor panicked: {}", panic_message(&*panic))),
            };
            let elapsed = started.elapsed();
            self.snapshot.write().current = None;

            report.executed += 1;
            let outcome = match result {
                Ok(()) => {
                    debug!(pid, ?elapsed, "proposal executed");
                    self.report_status(pid, ProposalStatus::Ready).await;
                    ExecutionOutcome {
                        pid,
                        ok: true,
                        error: None,
                        elapsed,
                        finished_at_utc: now_rfc3339(),
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    let msg = format!("{e:#}");
                    warn!(pid, error = %msg, "proposal execution failed");
                    self.report_status(pid, ProposalStatus::Failed).await;
                    if self.policy == FailurePolicy::StopBatch {
                        self.stop.store(true, Ordering::Release);
                    }
                    ExecutionOutcome {
                        pid,
                        ok: false,
                        error: Some(msg),
                        elapsed,
                        finished_at_utc: now_rfc3339(),
                    }
                }
            };
            self.emit(SchedulerEvent::ProposalFinished(outcome));
        }

        if report.exit == WorkerExit::Exhausted {
            self.emit(SchedulerEvent::Phase(WorkerPhase::Exhausted));
        }

        info!(
            exit = ?report.exit,
            executed = report.executed,
            failed = report.failed,
            skipped = report.skipped,
            "worker terminated"
        );
        self.emit(SchedulerEvent::Phase(WorkerPhase::Terminated));
        self.emit(SchedulerEvent::WorkerFinished(report));
        guard.finish();
        report
    }

    async fn report_status(&self, pid: Pid, status: ProposalStatus) {
        if let Err(e) = self.source.report_status(pid, status).await {
            let msg = format!("{e:#}");
            warn!(pid, ?status, error = %msg, "failed to report proposal status");
        }
    }

    fn emit(&self, ev: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryProposalSource;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct UnreachableSource;

    #[async_trait]
    impl ProposalSource for UnreachableSource {
        async fn get_proposals(&self) -> Result<Vec<Proposal>> {
            Ok(Vec::new())
        }

        async fn report_status(&self, _pid: Pid, _status: ProposalStatus) -> Result<()> {
            bail!("status store unreachable")
        }
    }

    struct PanickingSource;

    #[async_trait]
    impl ProposalSource for PanickingSource {
        async fn get_proposals(&self) -> Result<Vec<Proposal>> {
            Ok(Vec::new())
        }

        async fn report_status(&self, _pid: Pid, _status: ProposalStatus) -> Result<()> {
            panic!("status store corrupted");
        }
    }

    struct Panicking;

    #[async_trait]
    impl Executor for Panicking {
        async fn execute_observation(&self, proposal: &Proposal) -> Result<()> {
            if proposal.pid == 2 {
                panic!("mount fault");
            }
            Ok(())
        }
    }

    /// Records calls; optionally raises the stop flag while a given pid runs.
    struct Recording {
        seen: Mutex<Vec<Pid>>,
        snapshot: SharedSnapshot,
        observed_current: Mutex<Vec<Option<Pid>>>,
        stop_during: Option<(Pid, Arc<AtomicBool>)>,
        fail: Vec<Pid>,
    }

    #[async_trait]
    impl Executor for Recording {
        async fn execute_observation(&self, proposal: &Proposal) -> Result<()> {
            self.seen.lock().unwrap().push(proposal.pid);
            self.observed_current
                .lock()
                .unwrap()
                .push(self.snapshot.get().current);
            if let Some((pid, stop)) = &self.stop_during {
                if *pid == proposal.pid {
                    stop.store(true, Ordering::Release);
                }
            }
            if self.fail.contains(&proposal.pid) {
                bail!("boom");
            }
            Ok(())
        }
    }

    struct Fixture {
        exec: Arc<Recording>,
        source: Arc<MemoryProposalSource>,
        snapshot: SharedSnapshot,
        stop: Arc<AtomicBool>,
    }

    fn fixture(stop_during: Option<Pid>, fail: Vec<Pid>) -> Fixture {
        let snapshot = SharedSnapshot::new();
        snapshot.write().state = SchedulerState::Running;
        let stop = Arc::new(AtomicBool::new(false));
        Fixture {
            exec: Arc::new(Recording {
                seen: Mutex::new(Vec::new()),
                snapshot: snapshot.clone(),
                observed_current: Mutex::new(Vec::new()),
                stop_during: stop_during.map(|p| (p, stop.clone())),
                fail,
            }),
            source: Arc::new(MemoryProposalSource::default()),
            snapshot,
            stop,
        }
    }

    fn worker(
        f: &Fixture,
        pids: &[Pid],
        policy: FailurePolicy,
        event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    ) -> Worker {
        Worker {
            proposals: pids.iter().copied().map(Proposal::new).collect(),
            executor: f.exec.clone(),
            source: f.source.clone(),
            snapshot: f.snapshot.clone(),
            stop: f.stop.clone(),
            policy,
            event_tx,
        }
    }

    #[tokio::test]
    async fn runs_every_proposal_in_order() {
        let f = fixture(None, vec![]);
        let (tx, _rx) = oneshot::channel();
        let report = worker(&f, &[1, 2, 3], FailurePolicy::Continue, None)
            .run(tx)
            .await;

        assert_eq!(*f.exec.seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(
            *f.exec.observed_current.lock().unwrap(),
            vec![Some(1), Some(2), Some(3)]
        );
        assert_eq!(report.exit, WorkerExit::Exhausted);
        assert_eq!(report.executed, 3);
        let snap = f.snapshot.get();
        assert_eq!(snap.current, None);
        assert!(snap.worker_done);
        assert!(!snap.worker_aborted);
    }

    #[tokio::test]
    async fn status_report_errors_do_not_abort_the_batch() {
        let f = fixture(None, vec![]);
        let mut w = worker(&f, &[1, 2, 3], FailurePolicy::Continue, None);
        w.source = Arc::new(UnreachableSource);
        let (tx, _rx) = oneshot::channel();
        let report = w.run(tx).await;

        assert_eq!(*f.exec.seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(report.exit, WorkerExit::Exhausted);
        assert_eq!(report.executed, 3);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn executor_panic_is_a_failed_outcome() {
        let f = fixture(None, vec![]);
        let mut w = worker(&f, &[1, 2, 3], FailurePolicy::Continue, None);
        w.executor = Arc::new(Panicking);
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        w.event_tx = Some(ev_tx);
        let (tx, _rx) = oneshot::channel();
        let report = w.run(tx).await;

        assert_eq!(report.exit, WorkerExit::Exhausted);
        assert_eq!(report.executed, 3);
        assert_eq!(report.failed, 1);
        let mut errors = Vec::new();
        while let Ok(ev) = ev_rx.try_recv() {
            if let SchedulerEvent::ProposalFinished(o) = ev {
                if let Some(e) = o.error {
                    errors.push((o.pid, e));
                }
            }
        }
        assert_eq!(errors, vec![(2, "executor panicked: mount fault".to_string())]);
        assert_eq!(f.snapshot.get().current, None);
    }

    #[tokio::test]
    async fn dying_worker_clears_current_and_marks_itself_aborted() {
        let f = fixture(None, vec![]);
        let mut w = worker(&f, &[1, 2], FailurePolicy::Continue, None);
        w.source = Arc::new(PanickingSource);
        let (tx, _rx) = oneshot::channel();
        let joined = tokio::spawn(w.run(tx)).await;

        assert!(joined.unwrap_err().is_panic());
        let snap = f.snapshot.get();
        assert_eq!(snap.current, None);
        assert!(snap.worker_done);
        assert!(snap.worker_aborted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_done_is_published_after_the_final_events() {
        let f = fixture(None, vec![]);
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let (tx, _rx) = oneshot::channel();
        let w = worker(&f, &[1, 2], FailurePolicy::Continue, Some(ev_tx));
        let handle = tokio::spawn(w.run(tx));

        while !f.snapshot.get().worker_done {
            tokio::task::yield_now().await;
        }
        // Anyone seeing the worker as done must already be able to read its
        // terminal events.
        let mut tail = Vec::new();
        while let Ok(ev) = ev_rx.try_recv() {
            tail.push(ev);
        }
        assert!(matches!(
            tail.as_slice(),
            [
                ..,
                SchedulerEvent::Phase(WorkerPhase::Terminated),
                SchedulerEvent::WorkerFinished(_)
            ]
        ));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stop_during_item_finishes_it_and_skips_the_rest() {
        let f = fixture(Some(101), vec![]);
        let (tx, _rx) = oneshot::channel();
        let report = worker(&f, &[101, 102, 103], FailurePolicy::Continue, None)
            .run(tx)
            .await;

        assert_eq!(*f.exec.seen.lock().unwrap(), vec![101]);
        assert_eq!(report.exit, WorkerExit::Drained);
        assert_eq!(report.executed, 1);
        assert_eq!(report.skipped, 2);
    }

    #[tokio::test]
    async fn failures_do_not_abort_the_batch() {
        let f = fixture(None, vec![2]);
        let (tx, _rx) = oneshot::channel();
        let report = worker(&f, &[1, 2, 3], FailurePolicy::Continue, None)
            .run(tx)
            .await;

        assert_eq!(*f.exec.seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(report.failed, 1);
        assert_eq!(
            f.source.reported(),
            vec![
                (1, ProposalStatus::Running),
                (1, ProposalStatus::Ready),
                (2, ProposalStatus::Running),
                (2, ProposalStatus::Failed),
                (3, ProposalStatus::Running),
                (3, ProposalStatus::Ready),
            ]
        );
    }

    #[tokio::test]
    async fn stop_batch_policy_drains_after_failure() {
        let f = fixture(None, vec![2]);
        let (tx, _rx) = oneshot::channel();
        let report = worker(&f, &[1, 2, 3], FailurePolicy::StopBatch, None)
            .run(tx)
            .await;

        assert_eq!(*f.exec.seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(report.exit, WorkerExit::Drained);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn stop_before_first_item_runs_nothing_and_drops_ready() {
        let f = fixture(None, vec![]);
        f.stop.store(true, Ordering::Release);
        let (tx, rx) = oneshot::channel();
        let report = worker(&f, &[1, 2], FailurePolicy::Continue, None)
            .run(tx)
            .await;

        assert!(f.exec.seen.lock().unwrap().is_empty());
        assert_eq!(report.skipped, 2);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn emits_phases_and_outcomes() {
        let f = fixture(None, vec![]);
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let (tx, _rx) = oneshot::channel();
        worker(&f, &[5], FailurePolicy::Continue, Some(ev_tx))
            .run(tx)
            .await;

        let mut kinds = Vec::new();
        while let Ok(ev) = ev_rx.try_recv() {
            kinds.push(match ev {
                SchedulerEvent::Phase(p) => format!("{p:?}"),
                SchedulerEvent::ProposalStarted { pid } => format!("start {pid}"),
                SchedulerEvent::ProposalFinished(o) => format!("done {} {}", o.pid, o.ok),
                SchedulerEvent::WorkerFinished(r) => format!("finished {:?}", r.exit),
            });
        }
        assert_eq!(
            kinds,
            vec![
                "Starting",
                "Iterating",
                "start 5",
                "done 5 true",
                "Exhausted",
                "Terminated",
                "finished Exhausted",
            ]
        );
    }
}
