use thiserror::Error;

/// Pipeline-fatal failures.
///
/// Only transport-level problems surface here; malformed envelope lines are
/// dropped, and per-section recovery failures degrade to section state so a
/// single bad section never sinks the whole generation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("generation service returned status {status}: {message}")]
    Transport { status: u16, message: String },

    #[error("pipeline task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
