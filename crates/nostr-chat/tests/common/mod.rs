//! Test utilities

#![allow(dead_code)]

pub mod test_relay;
pub use test_relay::LocalRelay;

use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(10);

/// Receive until `pick` returns `Some`, failing the test after [`WAIT`].
pub async fn wait_for<T, R>(rx: &mut mpsc::UnboundedReceiver<T>, mut pick: impl FnMut(&T) -> Option<R>) -> R {
    let found = tokio::time::timeout(WAIT, async {
        while let Some(item) = rx.recv().await {
            if let Some(r) = pick(&item) {
                return Some(r);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(r)) => r,
        Ok(None) => panic!("channel closed before the expected item arrived"),
        Err(_) => panic!("timed out waiting for expected item"),
    }
}

/// Poll `check` until it holds, failing the test after [`WAIT`].
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met in time");
}
