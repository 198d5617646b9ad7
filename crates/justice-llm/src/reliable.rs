use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use justice_core::collab::{Evaluator, Grounded, Reasoner};
use justice_core::errors::CollaboratorError;
use justice_core::turns::{Party, TranscriptEntry};

/// Retry policy for collaborator calls.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff with jitter, floored at 10 ms.
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let spread = capped * self.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(10.0) as u64)
    }
}

/// Wraps a Reasoner or Evaluator and retries retryable failures.
///
/// Non-retryable errors (`Rejected`, `InvalidResponse`) return immediately.
/// The caller's overall timeout still bounds the whole sequence of attempts.
pub struct Reliable<T> {
    inner: T,
    config: RetryConfig,
    total_retries: AtomicU64,
}

impl<T> Reliable<T> {
    pub fn new(inner: T, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: T) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    async fn attempt<'a, R, F, Fut>(
        &'a self,
        op: &'static str,
        mut call: F,
    ) -> Result<R, CollaboratorError>
    where
        F: FnMut(&'a T) -> Fut,
        Fut: Future<Output = Result<R, CollaboratorError>>,
    {
        let mut attempt = 0;
        loop {
            match call(&self.inner).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.delay(attempt);
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        op,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        error_kind = e.error_kind(),
                        "retrying collaborator call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<T: Reasoner> Reasoner for Reliable<T> {
    async fn ask_with_context(&self, text: &str) -> Result<Grounded, CollaboratorError> {
        self.attempt("ask", |r| r.ask_with_context(text)).await
    }

    async fn generate_argument(&self, query: &str) -> Result<String, CollaboratorError> {
        self.attempt("argument", |r| r.generate_argument(query)).await
    }

    async fn generate_commentary(
        &self,
        last_turn: &TranscriptEntry,
    ) -> Result<String, CollaboratorError> {
        self.attempt("commentary", |r| r.generate_commentary(last_turn))
            .await
    }

    async fn generate_closing(
        &self,
        winner: Party,
        score_difference: f64,
    ) -> Result<String, CollaboratorError> {
        self.attempt("closing", |r| r.generate_closing(winner, score_difference))
            .await
    }
}

#[async_trait]
impl<T: Evaluator> Evaluator for Reliable<T> {
    async fn score(&self, text: &str, prior: Option<&str>) -> Result<f64, CollaboratorError> {
        self.attempt("score", |e| e.score(text, prior)).await
    }
}
