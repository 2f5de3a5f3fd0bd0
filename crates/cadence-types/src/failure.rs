//! Failure taxonomy for stage execution.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the engine reacts to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Transient (timeout, rate limit): bounded exponential backoff, then re-attempt.
    Retryable,
    /// Auth, configuration, malformed request: fail immediately.
    NonRetryable,
    /// Output did not meet its structural/quality contract: bounded quality retry
    /// with the missing elements fed into the next attempt's instructions.
    ValidationFail,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Retryable => "retryable",
            FailureClass::NonRetryable => "non_retryable",
            FailureClass::ValidationFail => "validation_fail",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retryable" => Ok(FailureClass::Retryable),
            "non_retryable" => Ok(FailureClass::NonRetryable),
            "validation_fail" => Ok(FailureClass::ValidationFail),
            other => Err(format!("invalid failure class: '{other}'")),
        }
    }
}

/// Typed failure raised by a stage body (or by the engine on its behalf, e.g. timeouts).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("stage timed out after {after_secs}s")]
    Timeout { after_secs: u64 },

    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("backend overloaded: {0}")]
    Overloaded(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Output did not satisfy its contract. `missing` lists the absent elements.
    #[error("output validation failed: {message}")]
    Validation {
        missing: Vec<String>,
        message: String,
    },

    /// Anything else. `hint` lets the stage suggest a classification.
    #[error("{message}")]
    Other {
        message: String,
        hint: Option<FailureClass>,
    },
}

impl StageError {
    /// Shorthand for a validation failure listing the missing elements.
    pub fn validation(missing: Vec<String>) -> Self {
        let message = format!("missing required elements: {}", missing.join(", "));
        StageError::Validation { missing, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_class_round_trips() {
        for class in [
            FailureClass::Retryable,
            FailureClass::NonRetryable,
            FailureClass::ValidationFail,
        ] {
            assert_eq!(class.as_str().parse::<FailureClass>().unwrap(), class);
        }
    }

    #[test]
    fn validation_shorthand_lists_missing_elements() {
        let err = StageError::validation(vec!["summary".into(), "sources".into()]);
        assert!(err.to_string().contains("summary, sources"));
        match err {
            StageError::Validation { missing, .. } => assert_eq!(missing.len(), 2),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn stage_error_display() {
        let err = StageError::Timeout { after_secs: 30 };
        assert_eq!(err.to_string(), "stage timed out after 30s");

        let err = StageError::RateLimited {
            retry_after_ms: Some(500),
        };
        assert!(err.to_string().contains("500"));
    }
}
