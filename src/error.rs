//! Provisioning errors
//!
//! One error type is shared by the volume backend, the target fabric and the
//! orchestrator so that a request handler can classify any failure.

use std::io;
use thiserror::Error;

/// Errors raised while provisioning or releasing a boot LUN
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Caller input is incomplete. Raised before any side effect.
    #[error("Missing parameters: {}", .0.join(", "))]
    MissingParameter(Vec<String>),

    /// A request body could not be decoded
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The operation targets a resource that must exist but does not
    #[error("{0}")]
    InvalidState(String),

    /// An external command exited non-zero
    #[error("`{command}` failed (exit code {code:?}): {output}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    /// An external command could not be started at all
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The target subsystem rejected a mutation
    #[error("target subsystem rejected {operation}: {message}")]
    BackendState { operation: String, message: String },
}

impl ProvisionError {
    /// Shorthand for a single missing field
    pub fn missing(field: &str) -> Self {
        ProvisionError::MissingParameter(vec![field.to_string()])
    }

    /// Wrap an I/O failure from the target subsystem
    pub fn backend(operation: impl Into<String>, err: io::Error) -> Self {
        ProvisionError::BackendState {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// True for errors that were detected before anything was mutated
    pub fn is_missing_parameter(&self) -> bool {
        matches!(self, ProvisionError::MissingParameter(_))
    }
}

/// Result type for provisioning operations
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Collect the names of absent required fields, in order.
///
/// Empty strings count as absent.
pub fn missing_fields(fields: &[(&str, bool)]) -> ProvisionResult<()> {
    let missing: Vec<String> = fields
        .iter()
        .filter(|(_, present)| !present)
        .map(|(name, _)| name.to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProvisionError::MissingParameter(missing))
    }
}

/// Presence test used with [`missing_fields`]
pub fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}
