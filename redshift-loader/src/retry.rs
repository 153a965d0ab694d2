//! Bounded retries with exponential backoff for staging and warehouse operations.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use redshift_config::shared::RetryConfig;
use tracing::warn;

use crate::error::LoaderResult;
use crate::metrics::{ERROR_KIND_LABEL, TARGET_RETRIES_TOTAL};

/// Computes the delay before retry number `attempt` (1-indexed).
///
/// The delay grows by `backoff_factor` per attempt, is capped at `max_delay_ms` and gets up
/// to 30% of random jitter.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let base_delay_ms = config.initial_delay_ms as f64 * config.backoff_factor.powi(exponent);
    let capped_delay_ms = base_delay_ms.min(config.max_delay_ms as f64);

    let jitter_factor = rand::rng().random::<f64>() * 0.3;
    let jittered_delay_ms = capped_delay_ms * (1.0 + jitter_factor);

    Duration::from_millis(jittered_delay_ms as u64)
}

/// Runs `operation` until it succeeds, fails with a non-transient error or has been tried
/// `max_attempts` times. The closure receives the 1-indexed attempt number.
pub async fn with_retries<T, F, Fut>(
    config: &RetryConfig,
    operation_name: &'static str,
    mut operation: F,
) -> LoaderResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = LoaderResult<T>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < config.max_attempts => {
                let delay = backoff_delay(config, attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                counter!(
                    TARGET_RETRIES_TOTAL,
                    ERROR_KIND_LABEL => format!("{:?}", err.kind())
                )
                .increment(1);

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
