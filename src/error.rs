use thiserror::Error;

/// Errors surfaced by the scheduler control surface.
///
/// A failed call never changes the scheduler state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("initialization failure: {0}")]
    InitializationFailure(String),
    #[error("scheduler already running")]
    AlreadyRunning,
    #[error("scheduler already stopped")]
    AlreadyStopped,
    #[error("no proposal executing")]
    NoProposalExecuting,
}
