use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use tracing::warn;

use dominds_core::errors::GeneratorError;
use dominds_core::generator::{BatchOutput, GenRequest, GenStream, Generator};
use dominds_core::stream::GenEvent;
use dominds_settings::DriverSettings;

/// Bounded retry with exponential backoff and jitter.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, counting the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(driver: &DriverSettings) -> Self {
        Self {
            max_attempts: driver.max_retry_attempts.max(1),
            base_delay: Duration::from_millis(driver.retry_base_delay_ms),
            max_delay: Duration::from_millis(driver.retry_max_delay_ms),
            ..Self::default()
        }
    }

    /// Delay before retrying after failed `attempt` (0-based). A
    /// server-suggested delay wins.
    pub fn delay_for(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }
        let exp = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let jitter_range = capped * self.jitter_factor.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    fn should_retry(&self, attempt: u32, error: &GeneratorError) -> bool {
        error.is_retryable() && attempt + 1 < self.max_attempts
    }
}

/// Wraps a generator with bounded retries.
///
/// A streaming attempt is retried only while it has produced no content
/// event; once anything reached the caller, an error is passed through so
/// partial output is never duplicated.
pub struct ReliableGenerator {
    inner: Arc<dyn Generator>,
    policy: RetryPolicy,
    total_retries: Arc<AtomicU64>,
}

impl ReliableGenerator {
    pub fn new(inner: Arc<dyn Generator>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            total_retries: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }
}

struct Attempts {
    inner: Arc<dyn Generator>,
    policy: RetryPolicy,
    request: GenRequest,
    attempt: u32,
    retries: Arc<AtomicU64>,
}

impl Attempts {
    async fn backoff(&mut self, error: &GeneratorError) {
        let delay = self.policy.delay_for(self.attempt, error.suggested_delay());
        self.retries.fetch_add(1, Ordering::Relaxed);
        warn!(
            dialog_id = %self.request.dialog_id,
            attempt = self.attempt + 1,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying generation"
        );
        self.attempt += 1;
        tokio::time::sleep(delay).await;
    }

    async fn open(&mut self) -> Result<GenStream, GeneratorError> {
        loop {
            match self.inner.stream(&self.request).await {
                Ok(stream) => return Ok(stream),
                Err(e) if self.policy.should_retry(self.attempt, &e) => self.backoff(&e).await,
                Err(e) => return Err(e),
            }
        }
    }
}

struct RetryingStream {
    attempts: Attempts,
    current: GenStream,
    seen_content: bool,
    finished: bool,
}

#[async_trait]
impl Generator for ReliableGenerator {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn stream(&self, request: &GenRequest) -> Result<GenStream, GeneratorError> {
        let mut attempts = Attempts {
            inner: self.inner.clone(),
            policy: self.policy.clone(),
            request: request.clone(),
            attempt: 0,
            retries: self.total_retries.clone(),
        };
        let current = attempts.open().await?;
        let state = RetryingStream {
            attempts,
            current,
            seen_content: false,
            finished: false,
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            if st.finished {
                return None;
            }
            loop {
                match st.current.next().await {
                    Some(GenEvent::Error { error })
                        if !st.seen_content && st.attempts.policy.should_retry(st.attempts.attempt, &error) =>
                    {
                        st.attempts.backoff(&error).await;
                        match st.attempts.open().await {
                            Ok(next) => st.current = next,
                            Err(error) => {
                                st.finished = true;
                                return Some((GenEvent::Error { error }, st));
                            }
                        }
                    }
                    Some(event) => {
                        st.seen_content |= event.is_content();
                        st.finished = matches!(event, GenEvent::Done | GenEvent::Error { .. });
                        return Some((event, st));
                    }
                    None => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn generate(&self, request: &GenRequest) -> Result<BatchOutput, GeneratorError> {
        let mut attempt = 0;
        loop {
            match self.inner.generate(request).await {
                Ok(out) => return Ok(out),
                Err(e) if self.policy.should_retry(attempt, &e) => {
                    let delay = self.policy.delay_for(attempt, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        dialog_id = %request.dialog_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying batch generation"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
