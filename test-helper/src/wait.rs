use std::time::Duration;

use tokio::time::{sleep, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls the predicate until it holds true or the timeout elapses.
///
/// Returns if the predicate was satisfied.
pub async fn wait_for<F>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }

        if Instant::now() >= deadline {
            return false;
        }

        sleep(POLL_INTERVAL).await;
    }
}
