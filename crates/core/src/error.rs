use thiserror::Error;

pub type TrackerResult<T> = Result<T, TrackerError>;

#[derive(Error, Debug)]
pub enum TrackerError {
    /// Connection reset/timeout/refused that outlived the retry budget.
    #[error("Transient infrastructure error: {0}")]
    TransientInfra(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported configuration: {0}")]
    UnsupportedConfig(String),

    #[error("External sink failure: {0}")]
    ExternalSink(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Retry exhausted after {attempts} attempts: {what}")]
    RetryExhausted { what: String, attempts: u32 },

    /// Optimistic transaction lost against a concurrent commit.
    #[error("Transaction conflict on {0}")]
    Conflict(String),

    #[error("Datastore error: {0}")]
    Datastore(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TrackerError {
    /// Whether redelivering the triggering message may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientInfra(_)
                | Self::ExternalSink(_)
                | Self::Conflict(_)
                | Self::RetryExhausted { .. }
                | Self::Datastore(_)
                | Self::Broker(_)
                | Self::Internal(_)
        )
    }

    /// Business-level drops: acknowledged, logged, never retried.
    pub fn is_drop(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::UnsupportedConfig(_) | Self::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_split() {
        assert!(TrackerError::TransientInfra("reset".into()).is_retryable());
        assert!(TrackerError::ExternalSink("502".into()).is_retryable());
        assert!(TrackerError::NotFound("instance".into()).is_drop());
        assert!(TrackerError::UnsupportedConfig("sink".into()).is_drop());
        assert!(!TrackerError::NotFound("click".into()).is_retryable());
        assert!(!TrackerError::Validation("empty".into()).is_retryable());
    }
}
