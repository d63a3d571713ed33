use std::time::Duration;
use tokio::task::JoinHandle;

/// How long a stopping component waits for its background task.
pub(crate) const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait for a cancelled background task to finish.
///
/// Cancellation is cooperative: a task that does not exit in time is logged
/// and left to finish on its own.
pub(crate) async fn join_with_timeout(handle: JoinHandle<()>, what: &str) {
    match tokio::time::timeout(JOIN_TIMEOUT, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_panic() => {
            tracing::error!("{} task panicked: {}", what, e);
        }
        Ok(Err(_)) => {}
        Err(_) => {
            tracing::warn!(
                "{} task did not stop within {:?}; leaving it to exit on its own",
                what,
                JOIN_TIMEOUT
            );
        }
    }
}
