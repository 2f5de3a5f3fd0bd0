//! Retry policy for failed attempts.
//!
//! Stateless: all decisions are pure functions of the failure class, the
//! counters persisted on the step and the engine configuration. Backoff has no
//! jitter so the retry schedule of a run is reproducible from its history.

use std::time::Duration;

use cadence_types::config::{BackoffConfig, EngineConfig};
use cadence_types::failure::FailureClass;

// ---------------------------------------------------------------------------
// RetryDecision
// ---------------------------------------------------------------------------

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then re-attempt with identical inputs.
    Backoff { delay: Duration },
    /// Re-attempt immediately with the missing elements appended to the instructions.
    QualityRetry { instruction: String },
    /// The failure is terminal for this step.
    GiveUp,
}

/// Counters the decision is made against.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    /// Retries already consumed on the step.
    pub retry_count: u32,
    /// Per-step cap (stage override or engine default).
    pub max_retries: u32,
    /// Quality retries already made within this execution.
    pub quality_retries: u32,
    pub max_quality_retries: u32,
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

pub struct RetryHandler;

impl RetryHandler {
    /// Decide the follow-up for a classified failure.
    pub fn decide(
        class: FailureClass,
        budget: RetryBudget,
        backoff: &BackoffConfig,
        retry_after_ms: Option<u64>,
        stage: &str,
        missing: &[String],
    ) -> RetryDecision {
        match class {
            FailureClass::Retryable if budget.retry_count < budget.max_retries => {
                RetryDecision::Backoff {
                    delay: Self::backoff_delay(backoff, budget.retry_count + 1, retry_after_ms),
                }
            }
            FailureClass::ValidationFail if budget.quality_retries < budget.max_quality_retries => {
                RetryDecision::QualityRetry {
                    instruction: Self::build_quality_instruction(
                        stage,
                        missing,
                        budget.quality_retries + 1,
                        budget.max_quality_retries,
                    ),
                }
            }
            _ => RetryDecision::GiveUp,
        }
    }

    /// Delay before retry number `retry_number` (1-based).
    ///
    /// `initial * multiplier^(n-1)`, capped at `max_ms`. A larger server
    /// `retry_after` hint wins, subject to the same cap.
    pub fn backoff_delay(
        config: &BackoffConfig,
        retry_number: u32,
        retry_after_ms: Option<u64>,
    ) -> Duration {
        let exponent = retry_number.saturating_sub(1);
        let factor = u64::from(config.multiplier.max(1)).saturating_pow(exponent);
        let computed = config.initial_ms.saturating_mul(factor).min(config.max_ms);
        let ms = match retry_after_ms {
            Some(hint) => computed.max(hint.min(config.max_ms)),
            None => computed,
        };
        Duration::from_millis(ms)
    }

    /// Retry cap for a stage: explicit override or the engine default.
    pub fn max_retries(config: &EngineConfig, stage_override: Option<u32>) -> u32 {
        stage_override.unwrap_or(config.max_retries)
    }

    /// Correction text fed into the next attempt after a quality failure.
    pub fn build_quality_instruction(
        stage: &str,
        missing: &[String],
        attempt: u32,
        max_attempts: u32,
    ) -> String {
        let mut text = format!(
            "Quality retry {attempt}/{max_attempts} for stage '{stage}'. \
             The previous output did not meet its requirements."
        );
        if !missing.is_empty() {
            text.push_str(" Include the following missing elements: ");
            text.push_str(&missing.join(", "));
            text.push('.');
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> BackoffConfig {
        BackoffConfig {
            initial_ms: 100,
            multiplier: 2,
            max_ms: 1_000,
        }
    }

    fn budget(retry_count: u32, quality_retries: u32) -> RetryBudget {
        RetryBudget {
            retry_count,
            max_retries: 3,
            quality_retries,
            max_quality_retries: 2,
        }
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let cfg = backoff();
        assert_eq!(RetryHandler::backoff_delay(&cfg, 1, None), Duration::from_millis(100));
        assert_eq!(RetryHandler::backoff_delay(&cfg, 2, None), Duration::from_millis(200));
        assert_eq!(RetryHandler::backoff_delay(&cfg, 3, None), Duration::from_millis(400));
        assert_eq!(RetryHandler::backoff_delay(&cfg, 5, None), Duration::from_millis(1_000));
        assert_eq!(RetryHandler::backoff_delay(&cfg, 64, None), Duration::from_millis(1_000));
    }

    #[test]
    fn retry_after_hint_wins_when_larger() {
        let cfg = backoff();
        assert_eq!(
            RetryHandler::backoff_delay(&cfg, 1, Some(700)),
            Duration::from_millis(700)
        );
        assert_eq!(
            RetryHandler::backoff_delay(&cfg, 3, Some(50)),
            Duration::from_millis(400)
        );
        assert_eq!(
            RetryHandler::backoff_delay(&cfg, 1, Some(10_000)),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn retryable_until_cap() {
        let cfg = backoff();
        let d = RetryHandler::decide(FailureClass::Retryable, budget(0, 0), &cfg, None, "s", &[]);
        assert!(matches!(d, RetryDecision::Backoff { .. }));
        let d = RetryHandler::decide(FailureClass::Retryable, budget(3, 0), &cfg, None, "s", &[]);
        assert_eq!(d, RetryDecision::GiveUp);
    }

    #[test]
    fn non_retryable_gives_up_immediately() {
        let d = RetryHandler::decide(
            FailureClass::NonRetryable,
            budget(0, 0),
            &backoff(),
            None,
            "s",
            &[],
        );
        assert_eq!(d, RetryDecision::GiveUp);
    }

    #[test]
    fn quality_retry_carries_missing_elements() {
        let missing = vec!["## Sources".to_string()];
        let d = RetryHandler::decide(
            FailureClass::ValidationFail,
            budget(0, 0),
            &backoff(),
            None,
            "draft",
            &missing,
        );
        match d {
            RetryDecision::QualityRetry { instruction } => {
                assert!(instruction.contains("## Sources"));
                assert!(instruction.contains("1/2"));
            }
            other => panic!("expected quality retry, got {other:?}"),
        }

        let d = RetryHandler::decide(
            FailureClass::ValidationFail,
            budget(0, 2),
            &backoff(),
            None,
            "draft",
            &missing,
        );
        assert_eq!(d, RetryDecision::GiveUp);
    }

    #[test]
    fn stage_override_beats_default_cap() {
        let cfg = EngineConfig::default();
        assert_eq!(RetryHandler::max_retries(&cfg, Some(1)), 1);
        assert_eq!(RetryHandler::max_retries(&cfg, None), cfg.max_retries);
    }
}
