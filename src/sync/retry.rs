use crate::api::{ApiResult, SyncError};
use crate::config::SyncConfig;
use crate::util::Timer;
use futures::future::{select, Either};
use std::future::Future;
use std::time::Duration;

/// Request-level retry for transient failures (network, 5xx).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &SyncConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base: cfg.retry_base,
            cap: cfg.retry_cap,
        }
    }

    /// Delay before retry number `retry` (0-based): base, 2×base, 4×base, … capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Bound `fut` by `limit`; expiry is reported as a network error.
pub async fn with_timeout<T>(
    timer: &dyn Timer,
    limit: Duration,
    fut: impl Future<Output = ApiResult<T>>,
) -> ApiResult<T> {
    futures::pin_mut!(fut);
    let sleep = timer.sleep(limit);
    match select(fut, sleep).await {
        Either::Left((res, _)) => res,
        Either::Right(((), _)) => Err(SyncError::timeout(limit.as_millis())),
    }
}

/// Run `op` with a per-attempt timeout, retrying retryable errors with backoff.
pub async fn run_with_retry<T, F, Fut>(
    policy: RetryPolicy,
    timer: &dyn Timer,
    timeout: Duration,
    label: &str,
    mut op: F,
) -> ApiResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ApiResult<T>>,
{
    let mut retry = 0;
    loop {
        match with_timeout(timer, timeout, op()).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && retry < policy.max_retries => {
                let delay = policy.delay_for(retry);
                tracing::debug!(
                    op = label,
                    attempt = retry + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient failure"
                );
                timer.sleep(delay).await;
                retry += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
