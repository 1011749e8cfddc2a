use crate::model::{Pid, Proposal};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

/// Performs the physical work for one proposal.
///
/// Called once per proposal from the worker; the worker waits for it to
/// return and is never interrupted mid-call.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute_observation(&self, proposal: &Proposal) -> Result<()>;
}

/// Stand-in for telescope + instrument control.
///
/// Slews to each target and "exposes" by sleeping for the target's exposure
/// time multiplied by `time_scale`.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    time_scale: f64,
    fail_pids: HashSet<Pid>,
}

impl SimulatedExecutor {
    pub fn new(time_scale: f64) -> Self {
        Self {
            time_scale: time_scale.max(0.0),
            fail_pids: HashSet::new(),
        }
    }

    /// Proposals in `pids` fail after their exposures complete.
    pub fn failing(mut self, pids: impl IntoIterator<Item = Pid>) -> Self {
        self.fail_pids.extend(pids);
        self
    }

    fn scaled(&self, d: Duration) -> Result<Duration> {
        Duration::try_from_secs_f64(d.as_secs_f64() * self.time_scale).with_context(|| {
            format!(
                "exposure {:?} scaled by {} is not a valid duration",
                d, self.time_scale
            )
        })
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[async_trait]
impl Executor for SimulatedExecutor {
    async fn execute_observation(&self, proposal: &Proposal) -> Result<()> {
        for target in &proposal.targets {
            debug!(
                pid = proposal.pid,
                tid = target.tid,
                az = target.coordinates.az,
                el = target.coordinates.el,
                "slewing to target"
            );
            tokio::time::sleep(self.scaled(target.exp_time)?).await;
            debug!(pid = proposal.pid, tid = target.tid, "image taken");
        }
        if self.fail_pids.contains(&proposal.pid) {
            bail!("simulated failure for proposal {}", proposal.pid);
        }
        Ok(())
    }
}
