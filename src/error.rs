//! Error types for Cadena
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for Cadena operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error type for all pipeline operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Malformed caller input: mismatched list lengths, zero steps, zero batch
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the argument
        reason: String,
    },

    /// Ensemble configuration is inconsistent with itself or with the
    /// introspected models
    #[error("ensemble config error: {reason}")]
    Config {
        /// What failed to validate
        reason: String,
    },

    /// A tensor the orchestrator needs was not produced where it looked
    #[error("output '{name}' is not produced by the final stage")]
    MissingOutput {
        /// Name of the missing output
        name: String,
    },

    /// A stage worker's model run failed; marshalled back through the
    /// response queue, never thrown across threads
    #[error("stage execution failed: {reason}")]
    RuntimeFailure {
        /// Failure description from the runtime
        reason: String,
    },

    /// The response queue's timed pop expired before any stage completed
    #[error("timed out after {timeout_ms} ms waiting for a stage response")]
    Timeout {
        /// The configured timeout in milliseconds
        timeout_ms: u64,
    },
}
