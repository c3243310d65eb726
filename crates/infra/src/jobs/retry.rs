//! Per-item AI call driver: timeout, classification, backoff.

use std::time::Duration;

use tracing::{debug, warn};

use recap_ai::{AiCaller, AiError, AnalysisResult};

use super::cancel::CancellationFlag;
use super::types::RetryPolicy;

/// What happened while driving one item through the AI caller.
#[derive(Debug)]
pub struct AttemptReport {
    pub outcome: Result<AnalysisResult, AiError>,
    /// Calls actually made.
    pub attempts: u32,
    /// Backoff delays slept between attempts, in order.
    pub delays: Vec<Duration>,
    /// Retrying stopped early because the job was cancelled.
    pub cancelled: bool,
}

/// Call `caller` until it succeeds, fails permanently, or the retry budget
/// is spent.
///
/// Every call is bounded by `timeout`; an elapsed timeout is a transient
/// failure. Cancellation is observed before each retry and wakes a pending
/// backoff sleep; an in-flight call is never interrupted.
pub async fn call_with_retry<C>(
    caller: &C,
    key: &str,
    text: &str,
    instructions: &str,
    policy: &RetryPolicy,
    timeout: Duration,
    cancel: &CancellationFlag,
) -> AttemptReport
where
    C: AiCaller + ?Sized,
{
    let mut attempts = 0u32;
    let mut delays = Vec::new();

    loop {
        attempts += 1;
        let result = match tokio::time::timeout(timeout, caller.analyze(text, instructions)).await
        {
            Ok(result) => result,
            Err(_) => Err(AiError::Timeout(timeout)),
        };

        let error = match result {
            Ok(analysis) => {
                debug!(key, attempts, "ai call succeeded");
                return AttemptReport {
                    outcome: Ok(analysis),
                    attempts,
                    delays,
                    cancelled: false,
                };
            }
            Err(e) => e,
        };

        let retries_done = attempts - 1;
        if !error.is_transient() || !policy.should_retry(retries_done) {
            warn!(
                key,
                attempts,
                transient = error.is_transient(),
                error = %error,
                "ai call failed, giving up"
            );
            return AttemptReport {
                outcome: Err(error),
                attempts,
                delays,
                cancelled: false,
            };
        }

        let delay = policy.delay_for_retry(retries_done + 1);
        debug!(key, attempts, delay_ms = delay.as_millis() as u64, error = %error, "retry scheduled");

        if cancel.is_cancelled() {
            return cancelled_report(error, attempts, delays);
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return cancelled_report(error, attempts, delays);
            }
        }
        delays.push(delay);

        if cancel.is_cancelled() {
            return cancelled_report(error, attempts, delays);
        }
    }
}

fn cancelled_report(error: AiError, attempts: u32, delays: Vec<Duration>) -> AttemptReport {
    debug!(attempts, "retry abandoned after cancellation");
    AttemptReport {
        outcome: Err(error),
        attempts,
        delays,
        cancelled: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::ScriptedCaller;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_retries, Duration::from_secs(1), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn always_transient_uses_every_attempt() {
        let caller = ScriptedCaller::new().always_transient();
        let report = call_with_retry(
            &caller,
            "k",
            "text",
            "instr",
            &policy(3),
            Duration::from_secs(60),
            &CancellationFlag::new(),
        )
        .await;

        assert!(report.outcome.is_err());
        assert_eq!(report.attempts, 4);
        assert_eq!(caller.calls(), 4);
        assert_eq!(
            report.delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert!(report.delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let caller = ScriptedCaller::new().fail_permanently_for(["k"]);
        let report = call_with_retry(
            &caller,
            "k",
            "k",
            "instr",
            &policy(5),
            Duration::from_secs(60),
            &CancellationFlag::new(),
        )
        .await;

        assert!(matches!(report.outcome, Err(AiError::InvalidInput(_))));
        assert_eq!(report.attempts, 1);
        assert!(report.delays.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let caller = ScriptedCaller::new().transient_failures_before_success(2);
        let report = call_with_retry(
            &caller,
            "k",
            "text",
            "instr",
            &policy(3),
            Duration::from_secs(60),
            &CancellationFlag::new(),
        )
        .await;

        assert!(report.outcome.is_ok());
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_means_one_attempt() {
        let caller = ScriptedCaller::new().always_transient();
        let report = call_with_retry(
            &caller,
            "k",
            "text",
            "instr",
            &policy(0),
            Duration::from_secs(60),
            &CancellationFlag::new(),
        )
        .await;
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_calls_time_out_and_retry() {
        let caller = ScriptedCaller::new().with_latency(Duration::from_secs(600));
        let report = call_with_retry(
            &caller,
            "k",
            "text",
            "instr",
            &policy(1),
            Duration::from_secs(60),
            &CancellationFlag::new(),
        )
        .await;

        assert!(matches!(report.outcome, Err(AiError::Timeout(_))));
        assert_eq!(report.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_backoff() {
        let caller = ScriptedCaller::new().always_transient();
        let cancel = CancellationFlag::new();
        cancel.cancel();

        let report = call_with_retry(
            &caller,
            "k",
            "text",
            "instr",
            &policy(5),
            Duration::from_secs(60),
            &cancel,
        )
        .await;

        assert!(report.cancelled);
        assert_eq!(report.attempts, 1);
        assert!(report.delays.is_empty());
    }
}
