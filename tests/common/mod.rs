#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use proposal_scheduler::{Executor, Pid, Proposal};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};

/// Executor that blocks every proposal until the test releases it.
pub struct GatedExecutor {
    started: watch::Sender<Vec<Pid>>,
    finished: Mutex<Vec<Pid>>,
    permits: Semaphore,
}

impl GatedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: watch::channel(Vec::new()).0,
            finished: Mutex::new(Vec::new()),
            permits: Semaphore::new(0),
        })
    }

    /// Let `n` more proposals complete.
    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    pub async fn wait_started(&self, n: usize) {
        let mut rx = self.started.subscribe();
        rx.wait_for(|v| v.len() >= n).await.unwrap();
    }

    pub fn started(&self) -> Vec<Pid> {
        self.started.borrow().clone()
    }

    pub fn finished(&self) -> Vec<Pid> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for GatedExecutor {
    async fn execute_observation(&self, proposal: &Proposal) -> Result<()> {
        self.started.send_modify(|v| v.push(proposal.pid));
        self.permits.acquire().await?.forget();
        self.finished.lock().unwrap().push(proposal.pid);
        Ok(())
    }
}
