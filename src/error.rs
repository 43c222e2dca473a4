//! Error taxonomy for the pass pipeline.
//!
//! Library-level failures are typed so the executor can decide, per error
//! class, whether a pass is `Failed`, `Skipped`, or whether the whole run
//! must stop. Application plumbing (config loading, CLI commands) keeps
//! using `anyhow`.

use thiserror::Error;

/// Problems with the pass registry itself.
///
/// An invalid order aborts a run before any record is touched.
/// [`ConfigurationError::EmptyPassOrder`] is the exception: callers treat it
/// as "nothing to do".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("pass order is empty")]
    EmptyPassOrder,

    #[error("pass order references unknown pass '{0}'")]
    UnknownPass(String),

    #[error("pass '{0}' appears more than once in the pass order")]
    DuplicateInOrder(String),

    #[error("pass '{name}' is misconfigured: {reason}")]
    InvalidDefinition { name: String, reason: String },

    #[error("scoring pass '{0}' is not part of the pass order")]
    UnknownScoringPass(String),
}

/// Failure of a single backend invocation.
///
/// Both variants are recorded against the pass as `Failed`; the record's
/// state is left untouched and the executor moves on to the next pass.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Credentials or tool binary missing.
    #[error("{backend} backend unavailable: {reason}")]
    Unavailable { backend: &'static str, reason: String },

    /// Request failed, non-zero exit, timeout, or malformed response.
    #[error("{backend} backend invocation failed: {reason}")]
    Invocation { backend: &'static str, reason: String },
}

impl BackendError {
    pub fn unavailable(backend: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unavailable {
            backend,
            reason: reason.into(),
        }
    }

    pub fn invocation(backend: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Invocation {
            backend,
            reason: reason.into(),
        }
    }
}

/// Errors raised by an [`ArtifactStore`](crate::store::ArtifactStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The pass is already completed for this record. Treated as a no-op.
    #[error("pass '{pass}' already completed for {artifact}")]
    DuplicatePass { artifact: String, pass: String },

    #[error("analysis record not found: {0}")]
    RecordNotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The scoring pass produced a payload that does not match the score schema.
///
/// Logged by the executor; never rolls back pass completion.
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("no result recorded for scoring pass '{0}'")]
    MissingScoringResult(String),

    #[error("scoring payload is not a JSON object: {0}")]
    InvalidJson(String),

    #[error("scoring payload is missing required field '{0}'")]
    MissingField(String),

    #[error("scoring field '{field}' is not numeric: {value}")]
    NotNumeric { field: String, value: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}
