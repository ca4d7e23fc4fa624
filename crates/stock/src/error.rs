//! Engine and service error types.

use thiserror::Error;

use stockline_core::{DomainError, RowId};

/// Result type returned by engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type returned by external collaborators.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Blocking failure of an engine operation.
///
/// Lookup failures are not represented here: a failed or empty service
/// response leaves the row unchanged and the operation still succeeds.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A mandatory value (company, item, warehouse) is missing.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The edit was rejected and `field` was reverted to its prior value.
    #[error("{field} rejected: {message}")]
    BusinessRule { field: &'static str, message: String },

    /// The row is not part of the document.
    #[error("row {0} not found")]
    RowNotFound(RowId),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// A derived value does not fit a `Decimal`.
    pub fn out_of_range(field: &'static str) -> Self {
        Self::Validation(format!("{field} is out of range"))
    }

    pub fn business_rule(field: &'static str, msg: impl Into<String>) -> Self {
        Self::BusinessRule {
            field,
            message: msg.into(),
        }
    }

    /// User-facing message, without the error category prefix.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Validation(msg) => msg.clone(),
            EngineError::BusinessRule { message, .. } => message.clone(),
            EngineError::RowNotFound(id) => format!("row {id} no longer exists"),
            EngineError::Domain(err) => err.to_string(),
        }
    }
}

/// Failure reported by an external collaborator (rate lookup, item master, ...).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service unavailable: {0}")]
    Unavailable(String),
}
