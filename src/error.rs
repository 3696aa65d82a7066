use thiserror::Error;

use crate::backend::BackendError;

/// Errors surfaced by the tuning pipeline.
///
/// Backend compile and launch failures are recoverable at the driver level
/// (the candidate is skipped); everything else aborts the run.
#[derive(Debug, Error)]
pub enum TuneError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unsupported expression: {0}")]
    UnsupportedExpressionKind(String),

    #[error(transparent)]
    Device(#[from] BackendError),
}
