use crate::error::TransferError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Bounded retry around one discrete command. Only errors classified as
/// transient are retried; everything else propagates on first failure.
/// Backoff is 2^attempt seconds, so a command that exhausts all attempts
/// waits 2s + 4s between tries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { max_attempts: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = Duration::from_secs(2u64.saturating_pow(attempt));
                    log::warn!(
                        "Retry {} after {}s for {} due to transient database error: {}",
                        attempt,
                        delay.as_secs(),
                        label,
                        err
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests;
