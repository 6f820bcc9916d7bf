//! Error taxonomy shared by every layer of the crate.
//!
//! Fallible APIs return [`anyhow::Result`]. Errors a caller must tell apart are
//! raised as a [`WorkflowError`] inside the `anyhow::Error`, so they can be
//! recovered with `err.downcast_ref::<WorkflowError>()`:
//!
//! ```
//! use vistrail::errors::WorkflowError;
//!
//! let err: anyhow::Error = WorkflowError::structure("dangling connection 3").into();
//! assert!(matches!(
//!     err.downcast_ref::<WorkflowError>(),
//!     Some(WorkflowError::Structure(_))
//! ));
//! ```
//!
//! Module compute failures are not part of this enum: the interpreter records
//! them as [`ModuleError`](crate::compute::ModuleError)s instead of propagating.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// Bad operation tuple, dangling reference, unmatched port signature, cycle.
    #[error("structural error: {0}")]
    Structure(String),

    /// A map element does not fit the declared type of its input port.
    #[error("type mismatch on port '{port}': {message}")]
    TypeMismatch { port: String, message: String },

    /// A module failed while executing in a context that must propagate it.
    #[error("module error: {0}")]
    Module(String),

    /// No workers, transport failure, undecodable worker response.
    #[error("worker error: {0}")]
    Worker(String),

    /// One or more map elements failed; one line per failing element.
    #[error("{0}")]
    MapAggregate(String),

    /// Requested output ports absent from a worker result.
    #[error("Output ports not found: {}", .0.join(", "))]
    MissingOutputs(Vec<String>),

    /// Unknown version, tag, module, connection or descriptor.
    #[error("not found: {0}")]
    NotFound(String),

    /// Serialization or locator failures.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl WorkflowError {
    pub fn structure(msg: impl Into<String>) -> Self {
        Self::Structure(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }
}

/// Return the [`WorkflowError`] carried by `err`, if any.
#[must_use]
pub fn classify(err: &anyhow::Error) -> Option<&WorkflowError> {
    err.downcast_ref::<WorkflowError>()
}
