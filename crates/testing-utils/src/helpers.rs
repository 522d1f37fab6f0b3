//! Test helper utilities and common testing patterns

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        Self::wait_for_with_interval(condition, timeout, Duration::from_millis(20)).await
    }

    /// Wait for a condition with a custom poll interval
    pub async fn wait_for_with_interval<F, Fut>(
        mut condition: F,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        loop {
            if condition().await {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_for_succeeds_eventually() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ok = TestEnv::wait_for(
            || {
                let calls = calls.clone();
                async move { calls.fetch_add(1, Ordering::SeqCst) >= 2 }
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let ok = TestEnv::wait_for_with_interval(
            || async { false },
            Duration::from_millis(30),
            Duration::from_millis(5),
        )
        .await;
        assert!(!ok);
    }
}
