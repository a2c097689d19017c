//! Error type for the Raft adapter

use logkv_core::LogKvError;

/// Errors surfaced to the consensus layer from Apply/Snapshot/Restore.
#[derive(Debug, thiserror::Error)]
pub enum FsmError {
    /// The storage engine rejected or failed the operation
    #[error(transparent)]
    Engine(#[from] LogKvError),

    /// Reading or writing the snapshot stream failed
    #[error("snapshot stream I/O failed: {0}")]
    Stream(#[from] std::io::Error),

    /// The snapshot sink was used after it was closed or cancelled
    #[error("snapshot sink {id} is {state}")]
    SinkFinished {
        /// Sink identifier
        id: String,
        /// "closed" or "cancelled"
        state: &'static str,
    },
}

impl FsmError {
    /// True if the engine has shut down.
    pub fn is_closed(&self) -> bool {
        matches!(self, FsmError::Engine(LogKvError::Closed))
    }
}

/// Result type alias for adapter operations
pub type FsmResult<T> = Result<T, FsmError>;
