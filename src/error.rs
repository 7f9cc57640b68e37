//! Error types for factline.
//!
//! All errors are strongly typed using thiserror. The taxonomy separates
//! configuration-time faults (validation), graph/storage faults (execution),
//! and network faults (transport), so callers can pattern match on the
//! condition they care about.

use thiserror::Error;

/// Validation errors raised while canonicalizing facts or compiling
/// specifications. These never change on retry.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The fact type string is empty.
    #[error("Fact type cannot be empty")]
    EmptyFactType,

    /// A field name or role name is empty.
    #[error("Empty {kind} name on fact type '{fact_type}'")]
    EmptyName {
        /// "field" or "role".
        kind: &'static str,
        /// The offending fact type.
        fact_type: String,
    },

    /// A numeric field holds NaN or an infinity, which has no canonical form.
    #[error("Field '{field}' is not a finite number")]
    NonFiniteNumber {
        /// Field name.
        field: String,
    },

    /// A fact failed a structural constraint.
    #[error("Invalid fact of type '{fact_type}': {reason}")]
    InvalidFact {
        /// The fact type.
        fact_type: String,
        /// Reason for invalidity.
        reason: String,
    },

    /// A specification failed compilation.
    #[error("Malformed specification: {reason}")]
    MalformedSpecification {
        /// Reason for invalidity.
        reason: String,
    },

    /// A label was referenced before any match bound it.
    #[error("Label '{label}' is referenced before it is bound")]
    UnboundLabel {
        /// The unbound label name.
        label: String,
    },

    /// A label was declared twice.
    #[error("Label '{label}' is declared more than once")]
    DuplicateLabel {
        /// The duplicated label name.
        label: String,
    },

    /// The types declared along a path condition cannot meet.
    #[error("Path condition for '{label}' cannot join: left side ends at '{left}', right side at '{right}'")]
    TypeContradiction {
        /// The unknown label being bound.
        label: String,
        /// Type at the end of the unknown-side walk.
        left: String,
        /// Type at the end of the known-side walk.
        right: String,
    },
}

/// Execution errors raised while operating on the fact graph.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A reference was required but is not in storage.
    #[error("Fact not found: {reference}")]
    NotFound {
        /// The missing reference, rendered `type:hash`.
        reference: String,
    },

    /// An ancestor closure entry is missing. This is a corruption signal
    /// and halts the operation.
    #[error("Storage corrupt: ancestor closure missing for {reference}")]
    Corrupt {
        /// The reference whose closure is damaged.
        reference: String,
    },

    /// No authorization rule admitted the fact.
    #[error("Forbidden: no authorization rule admits fact type '{fact_type}'")]
    Forbidden {
        /// The rejected fact type.
        fact_type: String,
    },

    /// The observer or subscriber was stopped mid-flight.
    #[error("Cancelled: {path}")]
    Cancelled {
        /// The component that was stopped.
        path: String,
    },

    /// A worker loop disconnected before producing a reply.
    #[error("Worker disconnected for {path} path")]
    Disconnected {
        /// Component name.
        path: String,
    },

    /// Operation timed out.
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        /// Duration before timeout.
        duration_ms: u64,
    },

    /// Storage backend error.
    #[error("Storage error: {message}")]
    Storage {
        /// Error details.
        message: String,
    },
}

/// Transport errors for client-remote communication.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network failure or a status the client treats as transient.
    /// The outbox retries these automatically.
    #[error("Retryable transport failure: {message}")]
    Retryable {
        /// Error details.
        message: String,
    },

    /// A definitive rejection that retrying cannot fix.
    #[error("Fatal transport failure (status {status}): {message}")]
    Fatal {
        /// HTTP status code.
        status: u16,
        /// Error details.
        message: String,
    },

    /// The server demanded reauthentication and the refreshed retry also
    /// failed.
    #[error("Unauthenticated (status {status})")]
    Unauthenticated {
        /// HTTP status code (401, 407, or 419).
        status: u16,
    },
}

/// Top-level error type for factline operations.
#[derive(Debug, Error)]
pub enum FactlineError {
    /// Input validation failed.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Execution failure.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Communication failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Internal system error.
    #[error("Internal error: {message}")]
    Internal {
        /// Error description.
        message: String,
    },
}

impl FactlineError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an authorization denial.
    #[must_use]
    pub const fn is_forbidden(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Forbidden { .. }))
    }

    /// Returns true if retrying the operation may succeed.
    ///
    /// Authorization denials and validation faults never become retryable;
    /// the offline queue must drop them rather than loop.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Execution(e) => matches!(e, ExecutionError::Timeout { .. }),
            Self::Transport(e) => matches!(e, TransportError::Retryable { .. }),
            Self::Validation(_) | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for factline operations.
pub type FactlineResult<T> = Result<T, FactlineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_messages() {
        let err = ValidationError::EmptyFactType;
        assert!(err.to_string().contains("empty"));

        let err = ValidationError::NonFiniteNumber {
            field: "score".to_string(),
        };
        assert!(err.to_string().contains("score"));

        let err = ValidationError::TypeContradiction {
            label: "task".to_string(),
            left: "List".to_string(),
            right: "Project".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("List"));
        assert!(msg.contains("Project"));
    }

    #[test]
    fn forbidden_names_the_fact_type() {
        let err: FactlineError = ExecutionError::Forbidden {
            fact_type: "Task".to_string(),
        }
        .into();
        assert!(err.is_forbidden());
        assert!(err.to_string().contains("Task"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn retryability() {
        let err: FactlineError = TransportError::Retryable {
            message: "connection refused".to_string(),
        }
        .into();
        assert!(err.is_retryable());

        let err: FactlineError = TransportError::Fatal {
            status: 422,
            message: "bad envelope".to_string(),
        }
        .into();
        assert!(!err.is_retryable());

        let err: FactlineError = ValidationError::EmptyFactType.into();
        assert!(!err.is_retryable());

        let err: FactlineError = ExecutionError::Timeout { duration_ms: 100 }.into();
        assert!(err.is_retryable());
    }

    #[test]
    fn corrupt_is_not_retryable() {
        let err: FactlineError = ExecutionError::Corrupt {
            reference: "List:abc".to_string(),
        }
        .into();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("List:abc"));
    }
}
