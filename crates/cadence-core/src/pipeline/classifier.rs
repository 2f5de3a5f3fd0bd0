//! Maps stage failures onto the engine's three failure classes.
//!
//! Every failed attempt is classified exactly once, and the class decides what
//! happens next: backoff-and-retry, immediate terminal failure, or a quality
//! retry that feeds the missing elements back into the stage.

use cadence_types::failure::{FailureClass, StageError};

/// Result of classifying one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub class: FailureClass,
    /// Stable machine-readable code recorded on the step and the run error.
    pub code: &'static str,
}

impl Classification {
    const fn new(class: FailureClass, code: &'static str) -> Self {
        Self { class, code }
    }
}

/// Stateless failure classifier.
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(error: &StageError) -> Classification {
        use FailureClass::*;

        match error {
            StageError::Timeout { .. } => Classification::new(Retryable, "timeout"),
            StageError::RateLimited { .. } => Classification::new(Retryable, "rate_limited"),
            StageError::Overloaded(_) => Classification::new(Retryable, "overloaded"),
            StageError::Transport(_) => Classification::new(Retryable, "transport"),
            StageError::Authentication(_) => {
                Classification::new(NonRetryable, "authentication")
            }
            StageError::Configuration(_) => Classification::new(NonRetryable, "configuration"),
            StageError::MalformedRequest(_) => {
                Classification::new(NonRetryable, "malformed_request")
            }
            StageError::Validation { .. } => Classification::new(ValidationFail, "validation_failed"),
            StageError::Other { hint: Some(class), .. } => Classification::new(*class, "stage_error"),
            // Unknown failures are not retried blindly.
            StageError::Other { hint: None, .. } => Classification::new(NonRetryable, "unclassified"),
        }
    }

    /// Server-suggested wait before the next attempt, if the failure carries one.
    pub fn retry_after_ms(error: &StageError) -> Option<u64> {
        match error {
            StageError::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_are_retryable() {
        for err in [
            StageError::Timeout { after_secs: 5 },
            StageError::RateLimited { retry_after_ms: None },
            StageError::Overloaded("529".into()),
            StageError::Transport("connection reset".into()),
        ] {
            assert_eq!(ErrorClassifier::classify(&err).class, FailureClass::Retryable, "{err:?}");
        }
    }

    #[test]
    fn caller_errors_are_non_retryable() {
        for err in [
            StageError::Authentication("bad key".into()),
            StageError::Configuration("no model".into()),
            StageError::MalformedRequest("400".into()),
        ] {
            assert_eq!(ErrorClassifier::classify(&err).class, FailureClass::NonRetryable);
        }
    }

    #[test]
    fn validation_failures_get_their_own_class() {
        let c = ErrorClassifier::classify(&StageError::validation(vec!["summary".into()]));
        assert_eq!(c.class, FailureClass::ValidationFail);
        assert_eq!(c.code, "validation_failed");
    }

    #[test]
    fn other_follows_hint_or_defaults_to_non_retryable() {
        let hinted = StageError::Other {
            message: "flaky".into(),
            hint: Some(FailureClass::Retryable),
        };
        assert_eq!(ErrorClassifier::classify(&hinted).class, FailureClass::Retryable);

        let bare = StageError::Other {
            message: "???".into(),
            hint: None,
        };
        let c = ErrorClassifier::classify(&bare);
        assert_eq!(c.class, FailureClass::NonRetryable);
        assert_eq!(c.code, "unclassified");
    }

    #[test]
    fn retry_after_only_from_rate_limits() {
        assert_eq!(
            ErrorClassifier::retry_after_ms(&StageError::RateLimited {
                retry_after_ms: Some(750)
            }),
            Some(750)
        );
        assert_eq!(
            ErrorClassifier::retry_after_ms(&StageError::Timeout { after_secs: 1 }),
            None
        );
    }
}
