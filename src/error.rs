//! Error types for the hearth session engine.

/// Top-level error type for the assistant.
#[derive(Debug, thiserror::Error)]
pub enum HearthError {
    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Capture worker failed and the restart budget is exhausted.
    ///
    /// This is the escalation signal: the binary exits nonzero so the
    /// service manager restarts the whole process.
    #[error("capture failed after {restarts} worker restarts")]
    CaptureFailed {
        /// Number of worker restarts attempted before giving up.
        restarts: u32,
    },

    /// Wake word detector error.
    #[error("wake detector error: {0}")]
    Wake(String),

    /// Turn segmentation error.
    #[error("turn engine error: {0}")]
    Turn(String),

    /// Streaming fast-agent connection error.
    #[error("live session error: {0}")]
    Live(String),

    /// Slow-brain reasoning error.
    #[error("backend error: {0}")]
    Backend(String),

    /// Tool dispatch error.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// Remote tool-service mesh error.
    #[error("mesh error: {0}")]
    Mesh(String),

    /// Device hub error.
    #[error("hub error: {0}")]
    Hub(String),

    /// Session control-loop error.
    #[error("session error: {0}")]
    Session(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Memory collaborator error.
    #[error("memory error: {0}")]
    Memory(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, HearthError>;
