use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};

/// True once the signal has been raised.
pub fn is_cancelled(signal: &watch::Receiver<bool>) -> bool {
    *signal.borrow()
}

/// Sleep for `duration` unless `signal` is raised first.
///
/// Returns `true` if the wait was cut short. A dropped sender can no longer
/// cancel, so the full duration is slept.
pub async fn sleep_or_cancel(duration: Duration, signal: &mut watch::Receiver<bool>) -> bool {
    if is_cancelled(signal) {
        return true;
    }
    let deadline = Instant::now() + duration;

    tokio::select! {
        _ = sleep_until(deadline) => false,
        raised = async { signal.wait_for(|v| *v).await.is_ok() } => {
            if !raised {
                sleep_until(deadline).await;
            }
            raised
        }
    }
}
