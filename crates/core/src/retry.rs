//! Retry with exponential backoff for remote operations.
//!
//! Transient transport faults are absorbed here; the session reconnects
//! between attempts, and once the attempt budget is exhausted the last
//! error escalates to a fatal transport error.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::remote::{RemoteSession, SharedSession};

/// Maximum backoff delay between attempts.
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Backoff schedule for retried operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Per-call timeout applied to each attempt.
    pub call_timeout: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(cfg: &SyncConfig) -> Self {
        Self {
            max_attempts: cfg.retry_max.max(1),
            base_delay: Duration::from_secs_f64(cfg.retry_base_delay_secs.max(0.0)),
            call_timeout: cfg.command_timeout(),
        }
    }

    /// Delay before the given retry (0-based attempt that just failed).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(MAX_DELAY)
    }
}

/// Run `op` up to `policy.max_attempts` times, reconnecting the shared
/// session and backing off between failed attempts. This is the wrapper
/// applied to every remote call the engine makes.
///
/// Non-retryable errors propagate immediately; a retryable error on the
/// last attempt escalates to a fatal transport error.
pub async fn with_session_retry<S, T, Fut, F>(
    policy: &RetryPolicy,
    session: &SharedSession<S>,
    what: &str,
    mut op: F,
) -> Result<T>
where
    S: RemoteSession,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        let outcome = match tokio::time::timeout(policy.call_timeout, op()).await {
            Ok(res) => res,
            Err(_) => Err(SyncError::transport(format!(
                "{what} timed out after {:?}",
                policy.call_timeout
            ))),
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(SyncError::transport_fatal(format!(
                        "{what} failed after {attempt} attempt(s): {err}"
                    )));
                }
                let delay = policy.delay_for(attempt - 1);
                warn!("{what} failed (attempt {attempt}/{}): {err}", policy.max_attempts);
                warn!("  reconnecting, then retrying in {delay:?}");
                sleep(delay).await;
                if let Err(rc) = session.lock().await.reconnect().await {
                    warn!("reconnect failed: {rc}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::remote::ExecOutput;

    /// Stub session that only counts reconnects.
    #[derive(Default)]
    struct StubSession {
        reconnects: u32,
    }

    #[async_trait]
    impl RemoteSession for StubSession {
        async fn exec(&mut self, _command: &str) -> Result<ExecOutput> {
            unreachable!("stub")
        }
        async fn upload(&mut self, _local: &Path, _remote: &str) -> Result<()> {
            unreachable!("stub")
        }
        async fn download(&mut self, _remote: &str, _local: &Path) -> Result<()> {
            unreachable!("stub")
        }
        async fn heartbeat(&mut self) -> Result<()> {
            Ok(())
        }
        async fn reconnect(&mut self) -> Result<()> {
            self.reconnects += 1;
            Ok(())
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            call_timeout: Duration::from_secs(5),
        }
    }

    fn session() -> SharedSession<StubSession> {
        Arc::new(Mutex::new(StubSession::default()))
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures_with_reconnects() {
        let session = session();
        let calls = AtomicU32::new(0);
        let result = with_session_retry(&policy(5), &session, "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SyncError::transport("flaky"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(session.lock().await.reconnects, 2);
    }

    #[tokio::test]
    async fn escalates_to_fatal_when_budget_exhausted() {
        let result: Result<()> = with_session_retry(&policy(3), &session(), "op", || async {
            Err(SyncError::transport("down"))
        })
        .await;
        match result {
            Err(SyncError::Transport { retryable, .. }) => assert!(!retryable),
            other => panic!("expected fatal transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_retryable_errors_propagate_immediately() {
        let session = session();
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_session_retry(&policy(5), &session, "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::Config("bad".into())) }
        })
        .await;
        assert!(matches!(result, Err(SyncError::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.lock().await.reconnects, 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            call_timeout: Duration::from_secs(5),
        };
        assert_eq!(p.delay_for(0), Duration::from_secs(1));
        assert_eq!(p.delay_for(1), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(8));
        assert_eq!(p.delay_for(9), Duration::from_secs(60));
    }
}
