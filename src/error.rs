use sled::transaction::TransactionError;

use crate::validation::FieldError;

pub type Result<T> = std::result::Result<T, WorkflowError>;

#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },
    #[error("Validation failed: {message}")]
    ValidationFailed {
        errors: Vec<FieldError>,
        message: String,
    },
    #[error("{0}")]
    BusinessRule(String),
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error("failed to decode record: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl WorkflowError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    pub fn rule(message: impl Into<String>) -> Self {
        Self::BusinessRule(message.into())
    }

    /// Builds a `ValidationFailed` whose message joins every error message with `", "`.
    pub fn validation(errors: Vec<FieldError>) -> Self {
        let message = errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        Self::ValidationFailed { errors, message }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::ValidationFailed { .. })
    }

    pub fn is_business_rule(&self) -> bool {
        matches!(self, Self::BusinessRule(_))
    }

    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            Self::ValidationFailed { errors, .. } => errors,
            _ => &[],
        }
    }
}

impl From<TransactionError<WorkflowError>> for WorkflowError {
    fn from(value: TransactionError<WorkflowError>) -> Self {
        match value {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => WorkflowError::Storage(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_joins_errors_in_order() {
        let err = WorkflowError::validation(vec![
            FieldError::new("title", "Title is required"),
            FieldError::new("lines[0].qty", "Line 1: Quantity must be a number"),
        ]);

        assert_eq!(
            err.to_string(),
            "Validation failed: Title is required, Line 1: Quantity must be a number"
        );
        assert_eq!(err.field_errors().len(), 2);
    }

    #[test]
    fn aborted_transaction_unwraps_to_inner_error() {
        let err: WorkflowError =
            TransactionError::Abort(WorkflowError::rule("nope")).into();
        assert!(err.is_business_rule());
    }
}
