use crate::error::SchedulerError;
use crate::executor::SimulatedExecutor;
use crate::model::{FailurePolicy, Pid, SchedulerEvent, StartOutcome, WorkerReport};
use crate::orchestrator::Controller;
use crate::source::FileProposalSource;
use crate::text_summary::{build_text_summary, RunSummary};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// What the worker does with the rest of the batch after a failed proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OnFailure {
    Continue,
    Stop,
}

impl From<OnFailure> for FailurePolicy {
    fn from(v: OnFailure) -> Self {
        match v {
            OnFailure::Continue => FailurePolicy::Continue,
            OnFailure::Stop => FailurePolicy::StopBatch,
        }
    }
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "proposal-scheduler",
    version,
    about = "Run queued observation proposals one at a time"
)]
pub struct Cli {
    /// JSON file holding the proposal queue
    #[arg(long, default_value = "proposals.json")]
    pub proposals: PathBuf,

    /// Multiplier applied to every target's exposure time
    #[arg(long, default_value_t = 1.0, value_parser = parse_time_scale)]
    pub time_scale: f64,

    /// Make the simulated executor fail this proposal (repeatable)
    #[arg(long = "fail-pid")]
    pub fail_pid: Vec<Pid>,

    /// Failure policy for the batch
    #[arg(long, value_enum, default_value_t = OnFailure::Continue)]
    pub on_failure: OnFailure,

    /// Request a graceful stop after this long
    #[arg(long)]
    pub stop_after: Option<humantime::Duration>,

    /// How often to poll for the proposal under execution
    #[arg(long, default_value = "500ms")]
    pub poll_interval: humantime::Duration,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

/// Accept finite, non-negative multipliers only.
fn parse_time_scale(s: &str) -> std::result::Result<f64, String> {
    let v: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if !v.is_finite() || v < 0.0 {
        return Err(format!("time scale must be a finite number >= 0, got {s}"));
    }
    Ok(v)
}

pub async fn run(args: Cli) -> Result<()> {
    let source = Arc::new(FileProposalSource::new(&args.proposals));
    let executor =
        Arc::new(SimulatedExecutor::new(args.time_scale).failing(args.fail_pid.iter().copied()));
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<SchedulerEvent>();

    let ctl = Controller::builder()
        .source(source)
        .executor(executor)
        .failure_policy(args.on_failure.into())
        .events(evt_tx)
        .build();

    let mut summary = match ctl.start().await.context("failed to start scheduler")? {
        StartOutcome::NothingToRun => {
            info!(path = %args.proposals.display(), "nothing queued");
            return print_summary(&args, &RunSummary::new(0));
        }
        StartOutcome::Started { queued } => RunSummary::new(queued),
    };

    let mut poll = tokio::time::interval(Duration::from(args.poll_interval));
    let mut last_seen: Option<Pid> = None;

    let stop_after = args.stop_after.map(Duration::from);
    let deadline = async {
        match stop_after {
            Some(d) => tokio::time::sleep(d).await,
            None => futures::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            ev = evt_rx.recv() => {
                match ev {
                    Some(ev) => {
                        if record_event(&mut summary, ev) {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = poll.tick() => {
                let now = ctl.proposal_under_execution().ok();
                if now != last_seen {
                    if let Some(pid) = now {
                        info!(pid, "proposal under execution");
                    }
                    last_seen = now;
                }
            }
            _ = &mut deadline => {
                info!("stop deadline reached, finishing current proposal");
                if let Some(report) = stop(&ctl).await? {
                    summary.report = Some(report);
                }
                break;
            }
            _ = &mut ctrl_c => {
                info!("interrupt received, finishing current proposal");
                if let Some(report) = stop(&ctl).await? {
                    summary.report = Some(report);
                }
                break;
            }
        }
    }

    // Pick up outcomes emitted while we were waiting on stop().
    while let Ok(ev) = evt_rx.try_recv() {
        record_event(&mut summary, ev);
    }

    print_summary(&args, &summary)
}

/// Stop the scheduler, treating a worker that already finished as success.
async fn stop(ctl: &Controller) -> Result<Option<WorkerReport>> {
    match ctl.stop().await {
        Ok(report) => Ok(Some(report)),
        Err(SchedulerError::AlreadyStopped) => Ok(None),
        Err(e) => Err(e).context("failed to stop scheduler"),
    }
}

/// Fold an event into the summary. Returns true once the worker has finished.
fn record_event(summary: &mut RunSummary, ev: SchedulerEvent) -> bool {
    match ev {
        SchedulerEvent::ProposalFinished(outcome) => {
            summary.outcomes.push(outcome);
            false
        }
        SchedulerEvent::WorkerFinished(report) => {
            summary.report = Some(report);
            true
        }
        SchedulerEvent::ProposalStarted { .. } | SchedulerEvent::Phase(_) => false,
    }
}

fn print_summary(args: &Cli, summary: &RunSummary) -> Result<()> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        for line in build_text_summary(summary).lines {
            println!("{line}");
        }
    }
    Ok(())
}
