//! Proposal sources.
//!
//! A source hands the controller an already-ordered batch at start time and
//! receives status bookkeeping from the worker while the batch runs.

use crate::model::{Pid, Proposal, ProposalStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[async_trait]
pub trait ProposalSource: Send + Sync {
    /// Ordered batch to run. An empty batch is valid.
    async fn get_proposals(&self) -> Result<Vec<Proposal>>;

    /// Record a status transition for `pid`.
    async fn report_status(&self, _pid: Pid, _status: ProposalStatus) -> Result<()> {
        Ok(())
    }
}

/// In-memory source. Keeps every reported status so callers can inspect them.
#[derive(Debug, Default)]
pub struct MemoryProposalSource {
    proposals: Vec<Proposal>,
    reported: Mutex<Vec<(Pid, ProposalStatus)>>,
}

impl MemoryProposalSource {
    pub fn new(proposals: Vec<Proposal>) -> Self {
        Self {
            proposals,
            reported: Mutex::new(Vec::new()),
        }
    }

    /// Convenience constructor for target-less proposals.
    pub fn from_pids(pids: impl IntoIterator<Item = Pid>) -> Self {
        Self::new(pids.into_iter().map(Proposal::new).collect())
    }

    /// Status reports received so far, oldest first.
    pub fn reported(&self) -> Vec<(Pid, ProposalStatus)> {
        self.reported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ProposalSource for MemoryProposalSource {
    async fn get_proposals(&self) -> Result<Vec<Proposal>> {
        Ok(self.proposals.clone())
    }

    async fn report_status(&self, pid: Pid, status: ProposalStatus) -> Result<()> {
        self.reported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((pid, status));
        Ok(())
    }
}

/// Source backed by a JSON array of proposals on disk.
///
/// Only `queued` proposals are handed out, in file order. Status reports are
/// written back to the same file.
pub struct FileProposalSource {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file.
    lock: tokio::sync::Mutex<()>,
}

impl FileProposalSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<Proposal>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse proposals in {}", self.path.display()))
    }
}

#[async_trait]
impl ProposalSource for FileProposalSource {
    async fn get_proposals(&self) -> Result<Vec<Proposal>> {
        let _guard = self.lock.lock().await;
        let all = self.load().await?;
        Ok(all
            .into_iter()
            .filter(|p| p.status == ProposalStatus::Queued)
            .collect())
    }

    async fn report_status(&self, pid: Pid, status: ProposalStatus) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut all = self.load().await?;
        let entry = all
            .iter_mut()
            .find(|p| p.pid == pid)
            .with_context(|| format!("proposal {pid} not found in {}", self.path.display()))?;
        entry.status = status;
        let out = serde_json::to_string_pretty(&all)?;
        tokio::fs::write(&self.path, out)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}
