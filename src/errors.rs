//! Error taxonomy of the back-end.
//!
//! Errors fall into three classes: diagnostics caused by the source program
//! (the front end reports them through its own location-aware sink and may
//! continue translating to find more), constructs the back-end does not
//! support, and internal invariant violations. Sink failures get their own
//! variant so drivers can distinguish a full disk from a bad program.

use thiserror::Error;

/// An error produced while lowering or emitting a translation unit.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// A problem in the source program, recoverable at the translation-unit
    /// level.
    #[error("{0}")]
    Diagnostic(String),

    /// A construct the back-end does not support.
    #[error("{0}")]
    Unsupported(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// The output sink failed.
    #[error("error writing output")]
    Io(#[from] std::io::Error),
}

/// A convenient alias for a `Result` using `CodegenError`.
pub type CodegenResult<T> = Result<T, CodegenError>;
