//! Error taxonomy shared by every layer of the engine.

use thiserror::Error;

/// Unified error type returned by the public API.
///
/// Variants correspond to the kinds enumerated for the reference engine's
/// error taxonomy, not to individual call sites -- callers match on kind,
/// not on message text.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("failed to load model: {0}")]
    LoadError(String),

    #[error("inference error: {0}")]
    InferenceError(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps to the public integer error-code table.
    ///
    /// Only the three codes the reference header documents
    /// (`OK`, `Unknown`, `InvalidHandle`, `InvalidArgument`) have dedicated
    /// values; everything else collapses to `Unknown` so the table never has
    /// to grow in lockstep with the internal taxonomy.
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidHandle(_) => -2,
            Error::InvalidArgument(_) => -3,
            _ => -1,
        }
    }
}

impl From<ort::Error> for Error {
    fn from(err: ort::Error) -> Self {
        Error::InferenceError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::LoadError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::LoadError(err.to_string())
    }
}
