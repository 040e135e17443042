//! Async runtime utilities shared across the driver.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, Result};

/// Awaits `future` while honoring cooperative cancellation of `token`.
///
/// Polling is biased towards the future: an outcome that has already settled
/// wins over a concurrent cancellation, otherwise cancellation takes effect
/// at this suspension point and the call rejects with a cancellation error.
pub(crate) async fn cancellable<F: Future>(
    token: &CancellationToken,
    future: F,
) -> Result<F::Output> {
    tokio::select! {
        biased;
        output = future => Ok(output),
        _ = token.cancelled() => Err(ErrorKind::Cancelled {
            message: "operation aborted by caller".to_string(),
        }
        .into()),
    }
}

/// Spawns a background task if a runtime is available, e.g. from a `Drop`
/// implementation that may run outside of one. Returns whether the task was
/// spawned.
pub(crate) fn spawn_if_runtime_available<F>(future: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::cancellable;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn settled_result_wins_over_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        // The future is already ready, so its outcome must win the race.
        let output = cancellable(&token, async { 42 }).await;
        assert_eq!(output.ok(), Some(42));
    }

    #[tokio::test]
    async fn pending_future_is_cancelled() {
        let token = CancellationToken::new();
        let pending = tokio::time::sleep(Duration::from_secs(3600));
        token.cancel();
        let err = cancellable(&token, pending).await.unwrap_err();
        assert!(matches!(err.kind.as_ref(), ErrorKind::Cancelled { .. }));
    }
}
