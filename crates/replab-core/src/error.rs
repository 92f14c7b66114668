use std::path::PathBuf;
use thiserror::Error;

/// Failure kinds the orchestrator branches on. Everything else travels as a
/// plain `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("malformed config {origin}: {reason}")]
    MalformedConfig { origin: String, reason: String },

    #[error("arity mismatch: {names} agent names but {models} models")]
    ArityMismatch { names: usize, models: usize },

    #[error("replica {index} destination already exists and is not empty: {}", path.display())]
    ReplicaExists { index: usize, path: PathBuf },

    #[error("execution context '{session}' is already live")]
    SessionConflict { session: String },

    #[error("task runner failed on replica {replica} attempt {attempt}: {status}")]
    TaskRunnerFailed {
        replica: usize,
        attempt: usize,
        status: String,
    },
}

impl OrchestratorError {
    /// Recoverable errors count as a failed attempt and never stop a loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, OrchestratorError::TaskRunnerFailed { .. })
    }
}
