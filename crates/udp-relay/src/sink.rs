// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The remote sink contract and the retry policy wrapped around submissions.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::batch::{Batch, BatchLimits};
use crate::errors::{RelayError, SinkError};

/// A batch-oriented message service client.
///
/// The sink owns its connection. Only the dispatch loop calls `submit_batch`; batch size
/// limits are exposed as a plain value so batches can be built anywhere.
#[async_trait]
pub trait RemoteSink: Send + Sync {
    /// Current size policy of the service.
    fn batch_limits(&self) -> BatchLimits;

    fn create_batch(&self) -> Batch {
        Batch::new(self.batch_limits())
    }

    /// Sends one sealed batch as a single network operation.
    async fn submit_batch(&self, batch: &Batch) -> Result<(), SinkError>;
}

/// How many times a batch is offered to the sink, and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Total attempts, no delay.
    Immediate(u64),
    /// Total attempts, and milliseconds to wait after each failed one.
    LinearBackoff(u64, u64),
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::LinearBackoff(3, 250)
    }
}

impl RetryStrategy {
    #[must_use]
    pub fn attempts(&self) -> u64 {
        match self {
            RetryStrategy::Immediate(attempts) | RetryStrategy::LinearBackoff(attempts, _) => {
                (*attempts).max(1)
            }
        }
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        match self {
            RetryStrategy::Immediate(_) => Duration::ZERO,
            RetryStrategy::LinearBackoff(_, delay_ms) => Duration::from_millis(*delay_ms),
        }
    }
}

/// Accepts `none`, `immediate:<attempts>` and `linear:<attempts>:<delay_ms>`.
impl FromStr for RetryStrategy {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RelayError::InvalidConfig(format!("Invalid retry strategy '{}'", s));
        let parts: Vec<&str> = s.trim().split(':').collect();
        match parts.as_slice() {
            ["none"] => Ok(RetryStrategy::Immediate(1)),
            ["immediate", attempts] => attempts
                .parse()
                .map(RetryStrategy::Immediate)
                .map_err(|_| invalid()),
            ["linear", attempts, delay_ms] => {
                let attempts = attempts.parse().map_err(|_| invalid())?;
                let delay_ms = delay_ms.parse().map_err(|_| invalid())?;
                Ok(RetryStrategy::LinearBackoff(attempts, delay_ms))
            }
            _ => Err(invalid()),
        }
    }
}

/// Submits `batch`, retrying transient failures as allowed by `retry`.
///
/// Permanent failures are returned at once. A cancellation during backoff gives up on
/// the batch and returns the last error.
pub async fn submit_with_retry<K: RemoteSink + ?Sized>(
    sink: &K,
    batch: &Batch,
    retry: &RetryStrategy,
    cancel_token: &CancellationToken,
) -> Result<(), SinkError> {
    let attempts = retry.attempts();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match sink.submit_batch(batch).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if err.is_permanent() || attempt >= attempts {
            return Err(err);
        }
        warn!(
            "Batch submission attempt {}/{} failed, retrying: {}",
            attempt, attempts, err
        );
        let delay = retry.delay();
        if !delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel_token.cancelled() => return Err(err),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::batch::Payload;
    use crate::test_support::{count_limits, RecordingSink, ScriptedFailure};
    use tracing_test::traced_test;

    fn batch_of(sink: &RecordingSink, payloads: &[&str]) -> Batch {
        let mut batch = sink.create_batch();
        for p in payloads {
            batch.try_add(Payload::from(*p)).unwrap();
        }
        batch
    }

    #[test]
    fn test_parse_retry_strategy() {
        assert_eq!(
            "immediate:3".parse::<RetryStrategy>().unwrap(),
            RetryStrategy::Immediate(3)
        );
        assert_eq!(
            "linear:4:100".parse::<RetryStrategy>().unwrap(),
            RetryStrategy::LinearBackoff(4, 100)
        );
        assert_eq!(
            "none".parse::<RetryStrategy>().unwrap(),
            RetryStrategy::Immediate(1)
        );
        assert!("linear:4".parse::<RetryStrategy>().is_err());
        assert!("exponential:3".parse::<RetryStrategy>().is_err());
        assert!("immediate:x".parse::<RetryStrategy>().is_err());
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        assert_eq!(RetryStrategy::Immediate(0).attempts(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let sink = RecordingSink::new(count_limits(10));
        sink.fail_next(&[ScriptedFailure::Transient]);
        let batch = batch_of(&sink, &["a", "b"]);

        submit_with_retry(
            &sink,
            &batch,
            &RetryStrategy::Immediate(3),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(sink.attempts(), 2);
        assert_eq!(sink.submitted_strings(), vec![vec!["a", "b"]]);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let sink = RecordingSink::new(count_limits(10));
        sink.fail_next(&[ScriptedFailure::Permanent]);
        let batch = batch_of(&sink, &["a"]);

        let result = submit_with_retry(
            &sink,
            &batch,
            &RetryStrategy::Immediate(3),
            &CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(sink.attempts(), 1);
        assert!(sink.submitted().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_retries_are_bounded() {
        let sink = RecordingSink::new(count_limits(10));
        sink.fail_next(&[ScriptedFailure::Transient; 5]);
        let batch = batch_of(&sink, &["a"]);

        let result = submit_with_retry(
            &sink,
            &batch,
            &RetryStrategy::Immediate(3),
            &CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(sink.attempts(), 3);
        assert!(logs_contain("Batch submission attempt 2/3 failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_backoff_waits_between_attempts() {
        let sink = RecordingSink::new(count_limits(10));
        sink.fail_next(&[ScriptedFailure::Transient, ScriptedFailure::Transient]);
        let batch = batch_of(&sink, &["a"]);

        let start = tokio::time::Instant::now();
        submit_with_retry(
            &sink,
            &batch,
            &RetryStrategy::LinearBackoff(3, 500),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert_eq!(sink.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let sink = RecordingSink::new(count_limits(10));
        sink.fail_next(&[ScriptedFailure::Transient]);
        let batch = batch_of(&sink, &["a"]);
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();

        let result = submit_with_retry(
            &sink,
            &batch,
            &RetryStrategy::LinearBackoff(3, 60_000),
            &cancel_token,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(sink.attempts(), 1);
    }
}
