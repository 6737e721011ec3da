//! Abort signals.
//!
//! A signal is a `watch` channel of `bool`: sending `true` aborts everything
//! waiting on a receiver. A dropped sender leaves waiters untouched.

use std::future;

use tokio::sync::watch;

/// A fresh, un-aborted signal.
pub fn abort_signal() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolves once `signal` reads `true`. Never resolves for `None` or when the
/// sender is gone without aborting.
pub async fn aborted(signal: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = signal else {
        return future::pending().await;
    };
    let fired = rx.wait_for(|aborted| *aborted).await.is_ok();
    if !fired {
        future::pending::<()>().await;
    }
}
