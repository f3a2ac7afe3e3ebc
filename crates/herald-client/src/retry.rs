//! Retry and backoff decisions for failed batches
//!
//! A failed send is classified by its [`TransportError`]. Fatal errors fail
//! every message of the batch at once. Retryable errors bump each message's
//! retry count; messages still within budget go back to the head of their
//! partition queue, the rest fail with [`DeliveryError::RetriesExhausted`].
//! With `max_retries = N` a message is transmitted at most `N + 1` times.

use crate::batcher::Batch;
use crate::config::ProducerConfig;
use crate::error::{DeliveryError, TransportError};
use crate::record::EnqueuedMessage;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a retry budget
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RetryPolicy {
    max_retries: u32,
    base: Duration,
    max: Duration,
    /// Fraction of the delay added as random jitter
    jitter: f64,
}

/// What to do with the messages of a failed batch
#[derive(Debug, Default)]
pub(crate) struct RetryDecision {
    /// Messages to put back at the head of the queue, in order
    pub requeue: Vec<EnqueuedMessage>,
    /// Messages that reached a terminal failure
    pub failed: Vec<(EnqueuedMessage, DeliveryError)>,
    /// Pause before the partition sends again
    pub delay: Option<Duration>,
}

impl RetryPolicy {
    pub(crate) fn from_config(config: &ProducerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: config.retry_backoff(),
            max: config.retry_backoff_max(),
            jitter: config.retry_jitter,
        }
    }

    /// Delay before the `retry_count`-th resend; the first resend waits `base`
    pub(crate) fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        let delay = self
            .base
            .saturating_mul(1u32 << exponent)
            .min(self.max);

        if self.jitter > 0.0 {
            let extra = delay.mul_f64(self.jitter * rand::thread_rng().gen::<f64>());
            delay + extra
        } else {
            delay
        }
    }

    pub(crate) fn on_failure(&self, batch: Batch, error: &TransportError) -> RetryDecision {
        let mut decision = RetryDecision::default();

        if !error.is_retryable() {
            decision.failed = batch
                .into_messages()
                .into_iter()
                .map(|m| (m, DeliveryError::Rejected(error.message.clone())))
                .collect();
            return decision;
        }

        let mut highest = 0;
        for mut message in batch.into_messages() {
            message.retry_count += 1;
            if message.retry_count > self.max_retries {
                let attempts = message.retry_count;
                decision.failed.push((
                    message,
                    DeliveryError::RetriesExhausted {
                        attempts,
                        last_error: error.message.clone(),
                    },
                ));
            } else {
                highest = highest.max(message.retry_count);
                decision.requeue.push(message);
            }
        }

        if !decision.requeue.is_empty() {
            decision.delay = Some(self.backoff(highest));
        }
        decision
    }
}
