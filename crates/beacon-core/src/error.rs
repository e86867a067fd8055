//! Error types for beacon.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or incomplete configuration (bad timeout, unversioned parent type).
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("credential resolution failed: {0}")]
    Credentials(String),

    #[error("no eligible worker: {0}")]
    NoEligibleWorker(String),

    #[error("backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),

    /// The ledger and the backend disagree about a container's existence.
    #[error("consistency fault: {0}")]
    Consistency(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("check failed: {0}")]
    CheckFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Multiple(#[from] MultiError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap this error with a message describing what was being attempted.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error once all context wrappers are peeled off.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_consistency_fault(&self) -> bool {
        match self.root() {
            Error::Consistency(_) => true,
            Error::Multiple(multi) => multi.errors().iter().any(Error::is_consistency_fault),
            _ => false,
        }
    }
}

/// Extension for attaching context to results.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }
}

/// Several independent failures from the same path, in the order they happened.
///
/// Used where a follow-up step (such as marking a container failed) can itself
/// fail after the primary error; both must reach the caller.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        match err {
            Error::Multiple(inner) => self.errors.extend(inner.errors),
            other => self.errors.push(other),
        }
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collapse into a single error: `None` when empty, the error itself when
    /// there is exactly one, otherwise the composite.
    pub fn into_error(mut self) -> Option<Error> {
        match self.errors.len() {
            0 => None,
            1 => self.errors.pop(),
            _ => Some(Error::Multiple(self)),
        }
    }
}

impl From<Vec<Error>> for MultiError {
    fn from(errors: Vec<Error>) -> Self {
        let mut multi = MultiError::new();
        for err in errors {
            multi.push(err);
        }
        multi
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n\t* {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

pub type Result<T> = std::result::Result<T, Error>;
