use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Dependency timed out: {0}")]
    DependencyTimeout(String),
    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),
    #[error("Retrieval unavailable: lexical and vector paths both failed")]
    RetrievalUnavailable,
    #[error("Overloaded: {0}")]
    Overloaded(String),
    #[error("LLM parsing error: {0}")]
    LlmParsing(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

/// What a failed answer surfaces to the caller.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct UserFacingError {
    pub error_kind: &'static str,
    pub suggestion: &'static str,
}

impl AppError {
    /// Maps an internal error onto the caller-visible `{error_kind, suggestion}` pair.
    pub fn user_facing(&self) -> UserFacingError {
        let (error_kind, suggestion) = match self {
            AppError::Validation(_) => ("input_invalid", "rephrase"),
            AppError::NotFound(_) => ("not_found", "upload more documents"),
            AppError::DependencyTimeout(_) => ("dependency_timeout", "retry"),
            AppError::DependencyUnavailable(_) | AppError::OpenAI(_) => {
                ("dependency_unavailable", "retry")
            }
            AppError::RetrievalUnavailable => ("retrieval_unavailable", "upload more documents"),
            AppError::Overloaded(_) => ("overloaded", "retry"),
            AppError::LlmParsing(_) => ("invalid_response", "retry"),
            _ => ("internal", "retry"),
        };

        UserFacingError {
            error_kind,
            suggestion,
        }
    }

    /// Retries make sense only for transient dependency failures.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::DependencyTimeout(_) | AppError::DependencyUnavailable(_)
        )
    }
}
