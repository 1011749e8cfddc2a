//! Sequential proposal scheduler.
//!
//! A [`Controller`] fetches an ordered batch from a [`ProposalSource`] and runs
//! it on a single background worker through an [`Executor`], one proposal at a
//! time. Stopping is graceful: the proposal in flight always finishes.

pub mod cli;
mod engine;
pub mod error;
pub mod executor;
mod metrics;
pub mod model;
pub mod orchestrator;
pub mod source;
pub mod text_summary;

pub use error::SchedulerError;
pub use executor::{Executor, SimulatedExecutor};
pub use model::{
    ExecutionOutcome, FailurePolicy, Pid, Proposal, ProposalStatus, SchedulerEvent,
    SchedulerState, StartOutcome, WorkerExit, WorkerPhase, WorkerReport,
};
pub use orchestrator::{Controller, ControllerBuilder};
pub use source::{FileProposalSource, MemoryProposalSource, ProposalSource};
