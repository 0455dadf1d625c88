use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ColorError {
    #[error("invalid hex color: {0:?}")]
    InvalidColorFormat(String),
}

#[derive(Debug, Error)]
pub enum TemplateError {
    /// The host has not produced the template image or the color catalog yet.
    /// Callers treat this as "not ready", never as "nothing to draw".
    #[error("template source unavailable: {0}")]
    SourceUnavailable(&'static str),

    #[error("pixel buffer of {len} bytes does not fit width {width}")]
    InvalidBuffer { len: usize, width: u32 },
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors that end a reconciliation run.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("session ended: no valid credentials after re-authentication")]
    SessionEnded,

    #[error("energy stayed at zero for {}s; the host energy source never initialized", waited.as_secs())]
    EnergyNeverInitialized { waited: Duration },

    #[error("template rejected: {0}")]
    Template(#[from] TemplateError),
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;
