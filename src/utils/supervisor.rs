use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("gave up after {restarts} consecutive restarts; last failure: {last_failure}")]
    GaveUp { restarts: u32, last_failure: String },
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// A run lasting at least this long resets the crash counter.
    pub stable_after: Duration,
}

impl From<&SupervisorConfig> for RestartPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        RestartPolicy {
            max_restarts: config.max_restarts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            stable_after: config.stable_after,
        }
    }
}

impl RestartPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(20));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs `run` in its own task until it returns `Ok`. Errors and panics are
/// restarted with exponential backoff until `max_restarts` consecutive
/// failures have been seen.
pub async fn supervise<F, Fut>(policy: &RestartPolicy, mut run: F) -> Result<(), SupervisorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut consecutive_failures = 0u32;
    loop {
        let started = Instant::now();
        let failure = match tokio::spawn(run()).await {
            Ok(Ok(())) => {
                info!("Dispatcher stopped cleanly");
                return Ok(());
            }
            Ok(Err(err)) => format!("{err:#}"),
            Err(join_err) if join_err.is_panic() => format!("panic: {join_err}"),
            Err(join_err) => join_err.to_string(),
        };

        if started.elapsed() >= policy.stable_after {
            consecutive_failures = 0;
        }
        if consecutive_failures >= policy.max_restarts {
            error!("Dispatcher failed {consecutive_failures} times in a row, giving up: {failure}");
            return Err(SupervisorError::GaveUp {
                restarts: consecutive_failures,
                last_failure: failure,
            });
        }

        let delay = policy.backoff(consecutive_failures);
        consecutive_failures += 1;
        warn!(
            "Dispatcher crashed: {failure}. Restarting in {:?} ({}/{})",
            delay, consecutive_failures, policy.max_restarts
        );
        tokio::time::sleep(delay).await;
    }
}
