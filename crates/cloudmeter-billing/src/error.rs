use cloudmeter_common::distributed::LockError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation error on {field}: {message}")]
    ValidationError { field: String, message: String },

    #[error("Account not found: {id}")]
    AccountNotFound { id: String },

    #[error("Cost center not found: {selector}")]
    CostCenterNotFound { selector: String },

    #[error("Resource not found: {selector}")]
    ResourceNotFound { selector: String },

    #[error("Exactly one {entity} must be specified, {matched} matched")]
    AmbiguousSelection { entity: String, matched: usize },

    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },

    #[error("Database error during {operation}: {source}")]
    DatabaseError {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Lock error: {0}")]
    LockError(#[from] LockError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },
}

impl BillingError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn database(operation: &str, source: sqlx::Error) -> Self {
        Self::DatabaseError {
            operation: operation.to_string(),
            source: Box::new(source),
        }
    }

    /// Whether the caller sent something the ledger refuses to apply, as
    /// opposed to a storage failure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::ValidationError { .. }
                | Self::AccountNotFound { .. }
                | Self::CostCenterNotFound { .. }
                | Self::ResourceNotFound { .. }
                | Self::AmbiguousSelection { .. }
                | Self::InvalidOperation { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BillingError>;
