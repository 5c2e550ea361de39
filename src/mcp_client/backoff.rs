//! Exponential backoff with jitter for transient tool-call failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::errors::{error_codes, McpError, Severity};

// ─── Config ──────────────────────────────────────────────────────────────────

/// Retry curve parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay applied as symmetric random jitter.
    pub jitter: f64,
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.1,
            max_retries: 5,
        }
    }
}

// ─── Backoff ─────────────────────────────────────────────────────────────────

/// State of one logical retry sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delays handed out so far in this sequence.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Next retry delay: `min(initial * multiplier^attempt, max)` ± jitter.
    ///
    /// Fails with `RETRY_EXHAUSTED` once `max_retries` delays have been
    /// produced. That error is permanent so an outer retry loop stops too.
    pub fn get_delay(&mut self) -> Result<Duration, McpError> {
        if self.attempt >= self.config.max_retries {
            return Err(McpError::new(
                error_codes::RETRY_EXHAUSTED,
                format!("exceeded maximum retries: {}", self.config.max_retries),
                Severity::Permanent,
            )
            .with_data("max_retries", self.config.max_retries));
        }

        let base = self.config.initial_delay_ms as f64
            * self.config.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.config.max_delay_ms as f64);

        let jitter = self.config.jitter.abs();
        let offset = if jitter > 0.0 {
            capped * jitter * rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        let delay_ms = (capped + offset).max(0.0);

        self.attempt += 1;
        Ok(Duration::from_micros((delay_ms * 1_000.0).round() as u64))
    }

    /// Start a fresh curve. Call after every fully successful operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ─── Retry Driver ────────────────────────────────────────────────────────────

/// Run `op` until it succeeds, retrying only transient failures.
///
/// Recoverable and permanent errors are returned after the attempt that
/// produced them. When the backoff is exhausted the result is a
/// `RETRY_EXHAUSTED` error wrapping the last transient failure.
pub async fn retry_transient<T, F, Fut>(
    backoff: &mut Backoff,
    label: &str,
    mut op: F,
) -> Result<T, McpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, McpError>>,
{
    loop {
        match op().await {
            Ok(value) => {
                backoff.reset();
                return Ok(value);
            }
            Err(err) if err.is_retryable() => match backoff.get_delay() {
                Ok(delay) => {
                    tracing::warn!(
                        op = label,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(exhausted) => {
                    tracing::error!(
                        op = label,
                        retries = backoff.config().max_retries,
                        error = %err,
                        "giving up after retries"
                    );
                    let message = format!(
                        "'{label}' failed after {} retries: {}",
                        backoff.config().max_retries,
                        err.message
                    );
                    return Err(McpError {
                        message,
                        ..exhausted
                    }
                    .with_data("last_error", err.message.clone())
                    .with_cause(err));
                }
            },
            Err(err) => return Err(err),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
