//! Bounded execution of blocking response work.
//!
//! Response generation may block on storage I/O, so it runs on the blocking
//! pool with an upper bound on how long the caller waits. Work that exceeds the
//! bound is abandoned and never retried.

use std::time::Duration;

use thiserror::Error;
use tokio::task;
use tracing::warn;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Response generation exceeded {0:?}")]
    TimedOut(Duration),

    #[error("Response generation aborted: {0}")]
    Aborted(String),
}

/// Run `work` on the blocking pool and wait at most `limit` for its result
pub async fn run_bounded<T, F>(limit: Duration, work: F) -> Result<T, DispatchError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let handle = task::spawn_blocking(work);
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(DispatchError::Aborted(e.to_string())),
        Err(_) => {
            // the blocking thread cannot be interrupted; its result is dropped
            warn!("Abandoning work after {:?}", limit);
            Err(DispatchError::TimedOut(limit))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_result_within_limit() {
        let value = run_bounded(Duration::from_secs(1), || 40 + 2).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn slow_work_times_out() {
        let err = run_bounded(Duration::from_millis(50), || {
            std::thread::sleep(Duration::from_millis(500));
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DispatchError::TimedOut(_)));
    }

    #[tokio::test]
    async fn panicking_work_is_aborted() {
        let err = run_bounded(Duration::from_secs(1), || -> u8 { panic!("boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Aborted(_)));
    }
}
