use easel_contracts::providers::{FailureClass, ProviderFailure, QuotaRules};
use thiserror::Error;

/// Failure taxonomy of a generation request.
///
/// Only `Validation` ever reaches a dispatcher; every other variant is
/// folded into the owning message's status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("network error: {0}")]
    Network(String),

    #[error("provider rejected the request ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("quota or rate limit reached: {message}")]
    QuotaOrRateLimit { message: String },

    #[error("{0}")]
    Validation(String),

    #[error("provider reported success but returned no media")]
    ProviderEmptyResult,

    #[error("{0}")]
    Unknown(String),
}

impl GenerationError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn from_failure(failure: &ProviderFailure, rules: &QuotaRules) -> Self {
        let message = failure.message.clone();
        match rules.classify(failure) {
            FailureClass::QuotaOrRateLimit => Self::QuotaOrRateLimit { message },
            FailureClass::Network => Self::Network(message),
            FailureClass::Http(status) => Self::Http { status, message },
            FailureClass::Unknown => Self::Unknown(message),
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaOrRateLimit { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Short text written into the failed message's status.
    pub fn user_message(&self) -> String {
        match self {
            Self::Network(_) => "Could not reach the generation service.".to_string(),
            Self::Http { status, message } => format!("Provider error {status}: {message}"),
            Self::QuotaOrRateLimit { .. } => {
                "The provider's quota or rate limit was reached. Try again later.".to_string()
            }
            Self::Validation(message) => message.clone(),
            Self::ProviderEmptyResult => {
                "The provider finished without returning any media.".to_string()
            }
            Self::Unknown(message) => message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use easel_contracts::providers::{ProviderFailure, QuotaRules};

    use super::GenerationError;

    #[test]
    fn failures_map_onto_taxonomy() {
        let rules = QuotaRules::default();
        assert!(GenerationError::from_failure(
            &ProviderFailure::http(429, None, "slow down"),
            &rules
        )
        .is_quota());
        assert_eq!(
            GenerationError::from_failure(&ProviderFailure::http(503, None, "down"), &rules),
            GenerationError::Http {
                status: 503,
                message: "down".to_string()
            }
        );
        assert_eq!(
            GenerationError::from_failure(&ProviderFailure::transport("reset"), &rules),
            GenerationError::Network("reset".to_string())
        );
    }

    #[test]
    fn validation_message_is_shown_verbatim() {
        let err = GenerationError::validation("Blend needs at least two images.");
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "Blend needs at least two images.");
        assert_eq!(err.user_message(), "Blend needs at least two images.");
    }
}
