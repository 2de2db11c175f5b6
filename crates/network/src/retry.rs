//! Exponential backoff and retry
//!
//! Used for discovery calls and for re-establishing lost sessions. Waiting
//! always races the entity's cancellation token.

use std::future::Future;
use std::time::Duration;

use dmsg_core::{BackoffConfig, RetryConfig};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Delay generator: `initial, initial * factor, ...`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    next: Duration,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            config: *config,
            next: config.initial,
        }
    }

    fn cap(&self, d: Duration) -> Duration {
        if self.config.max.is_zero() {
            d
        } else {
            d.min(self.config.max)
        }
    }

    /// Delay to wait now; grows the following one.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.cap(self.next);
        let grown = Duration::try_from_secs_f64(current.as_secs_f64() * self.config.factor.max(1.0))
            .unwrap_or(Duration::MAX);
        self.next = self.cap(grown);
        current
    }

    pub fn reset(&mut self) {
        self.next = self.config.initial;
    }

    /// Sleep for the next delay. Returns false if cancelled first.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    Cancelled,
    /// Every allowed attempt failed; carries the last error.
    Exhausted(E),
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Cancelled => write!(f, "retry cancelled"),
            RetryError::Exhausted(e) => write!(f, "retries exhausted: {e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Exhausted(e) => Some(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Retrier {
    config: RetryConfig,
}

impl Retrier {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `op` until it succeeds, the tries run out or `cancel` fires.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut backoff = Backoff::new(&self.config.backoff);
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            attempt = attempt.saturating_add(1);
            if self.config.tries != 0 && attempt >= self.config.tries {
                return Err(RetryError::Exhausted(err));
            }
            debug!(attempt, error = %err, "Retrying after failure");
            if !backoff.wait(cancel).await {
                return Err(RetryError::Cancelled);
            }
        }
    }
}
