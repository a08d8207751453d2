use thiserror::Error as ThisError;

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Input rejected before any external system was touched. Never retried.
    #[error("Invalid {field} '{value}': {reason}")]
    Validation { field: String, value: String, reason: String },

    /// A prerequisite is missing (e.g. the tenant's OS user)
    #[error("{resource} '{id}' not found")]
    NotFound { resource: String, id: String },

    /// A single external call failed. Only the create step of a reconciliation produces this,
    /// and only its bootstrap-and-retry path consumes it.
    #[error("Failed to {operation}: {output}")]
    TransientExternal { operation: String, output: String },

    /// An external call failed and will not be retried
    #[error("Failed to {operation}: {output}")]
    FatalExternal { operation: String, output: String },

    /// Configuration values that cannot work
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn fatal(operation: impl Into<String>, output: impl Into<String>) -> Self {
        Error::FatalExternal {
            operation: operation.into(),
            output: output.into(),
        }
    }

    pub fn transient(operation: impl Into<String>, output: impl Into<String>) -> Self {
        Error::TransientExternal {
            operation: operation.into(),
            output: output.into(),
        }
    }

    /// Whether the reconciler may bootstrap and retry after this error
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientExternal { .. })
    }

    /// Promote a transient failure to a fatal one once the sanctioned retry is spent.
    pub fn into_fatal(self) -> Self {
        match self {
            Error::TransientExternal { operation, output } => Error::FatalExternal { operation, output },
            other => other,
        }
    }

    /// The literal diagnostic text of an external failure, if there is one
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Error::TransientExternal { output, .. } | Error::FatalExternal { output, .. } => Some(output),
            _ => None,
        }
    }
}
