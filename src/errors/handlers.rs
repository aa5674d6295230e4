use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::settings::HypervisorSettings;
use crate::core::libvirt::HypervisorError;

/// Bounds every hypervisor call with a timeout and retries calls that time out.
///
/// Only timeouts are retried. A call that returns an error was answered by the
/// hypervisor, so repeating it would just repeat the answer.
#[derive(Debug, Clone)]
pub struct CollaboratorGuard {
    timeout: Duration,
    max_attempts: u32,
    backoff: Duration,
}

impl CollaboratorGuard {
    pub fn new(timeout: Duration, timeout_retries: u32, backoff: Duration) -> Self {
        Self {
            timeout,
            max_attempts: timeout_retries + 1,
            backoff,
        }
    }

    pub fn from_settings(settings: &HypervisorSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.call_timeout_secs),
            settings.timeout_retries,
            Duration::from_millis(settings.retry_backoff_ms),
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn call<T, F, Fut>(&self, operation: &'static str, mut f: F) -> Result<T, HypervisorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HypervisorError>>,
    {
        let mut delay = self.backoff;

        for attempt in 1..=self.max_attempts {
            match tokio::time::timeout(self.timeout, f()).await {
                Ok(result) => {
                    if attempt > 1 && result.is_ok() {
                        info!(operation, attempt, "Hypervisor call succeeded after retries");
                    }
                    return result;
                }
                Err(_) => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Hypervisor call timed out"
                    );
                    if attempt < self.max_attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        error!(operation, "Maximum retries reached, giving up on hypervisor call");
        Err(HypervisorError::Timeout {
            operation,
            after: self.timeout,
        })
    }
}
