//! Error types for narrative-orchestration.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] narrative_storage::StorageError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("insufficient data: {message}")]
    InsufficientData {
        message: String,
        missing_data: &'static str,
    },

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("provider rate limit exceeded")]
    ProviderRateLimit,

    #[error("provider authentication failed: {0}")]
    ProviderAuth(String),

    #[error("provider token limit exceeded")]
    ProviderTokenLimit,

    #[error("provider error: {0}")]
    ProviderOther(String),

    #[error("daily budget exceeded: today_total={today_total:.4} daily_budget={daily_budget:.4}")]
    BudgetExceeded { today_total: f64, daily_budget: f64 },

    #[error("invalid pipeline plan: {0}")]
    PipelineInvalidPlan(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn insufficient_data(message: impl Into<String>, missing_data: &'static str) -> Self {
        Self::InsufficientData {
            message: message.into(),
            missing_data,
        }
    }

    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat(message.into())
    }

    pub fn invalid_plan(message: impl Into<String>) -> Self {
        Self::PipelineInvalidPlan(message.into())
    }

    /// Whether this error is the kind the provider registry's bounded retry
    /// loop should retry — rate limits only, per the client contract.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderRateLimit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limit_is_retryable() {
        assert!(EngineError::ProviderRateLimit.is_retryable());
        assert!(!EngineError::ProviderTokenLimit.is_retryable());
        assert!(!EngineError::ProviderAuth("bad key".into()).is_retryable());
        assert!(!EngineError::ProviderOther("boom".into()).is_retryable());
    }

    #[test]
    fn not_found_formats_entity_and_id() {
        let err = EngineError::not_found("chapter", 42);
        assert_eq!(err.to_string(), "chapter not found: 42");
    }

    #[test]
    fn budget_exceeded_carries_both_values() {
        let err = EngineError::BudgetExceeded {
            today_total: 0.002,
            daily_budget: 0.001,
        };
        assert!(err.to_string().contains("0.0020"));
    }
}
