//! Fixed-pause retry policy for remote operations.
//!
//! Ledger and confidential network calls made during settlement are
//! retried until they succeed. The policy makes that loop explicit.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

/// How a failed remote operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between two attempts.
    pub pause: Duration,

    /// Give up after this many attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retry forever with a fixed pause.
    pub fn unbounded(pause: Duration) -> Self {
        Self {
            pause,
            max_attempts: None,
        }
    }

    #[cfg(test)]
    pub fn bounded(pause: Duration, max_attempts: u32) -> Self {
        Self {
            pause,
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    /// Run `operation` until it succeeds or the attempts are exhausted.
    pub async fn run<F, Fut, T, E>(&self, label: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt: u32 = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if self.max_attempts.map_or(false, |max| attempt >= max) {
                        warn!("{} failed after {} attempts: {}", label, attempt, e);
                        return Err(e);
                    }
                    warn!(
                        "{} failed (attempt {}): {}. Retrying in {:?}...",
                        label, attempt, e, self.pause
                    );
                    tokio::time::sleep(self.pause).await;
                    attempt += 1;
                }
            }
        }
    }
}
