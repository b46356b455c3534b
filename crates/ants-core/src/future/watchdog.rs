use super::{AbortHandler, Awaiter};
use crate::error::AntError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Watchdog mode: runs `handler` while `watchdog` is probed every `interval`.
///
/// The first of {main result, watchdog error, cancellation} is delivered.
/// A watchdog error wins over a main result that is ready at the same time.
/// The watchdog loop ends once the main handler has finished.
pub fn execute_watchdog<T, F, Fut, W, WFut>(
    token: &CancellationToken,
    handler: F,
    mut watchdog: W,
    abort: Option<AbortHandler>,
    interval: Duration,
) -> Awaiter<T>
where
    T: Send + 'static,
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, AntError>> + Send + 'static,
    W: FnMut(CancellationToken) -> WFut + Send + 'static,
    WFut: Future<Output = Result<(), AntError>> + Send + 'static,
{
    let stop = token.child_token();
    let watch_stop = stop.child_token();
    let (tx, rx) = mpsc::channel(1);
    let (err_tx, err_rx) = oneshot::channel();
    let running = Arc::new(AtomicBool::new(true));
    let interval = interval.max(Duration::from_millis(1));

    let work = handler(stop.clone());
    let flag = running.clone();
    let main_done = watch_stop.clone();
    tokio::spawn(async move {
        let res = work.await;
        flag.store(false, Ordering::SeqCst);
        let _ = tx.send(res).await;
        main_done.cancel();
    });

    let flag = running.clone();
    tokio::spawn(async move {
        loop {
            if let Err(err) = watchdog(watch_stop.clone()).await {
                flag.store(false, Ordering::SeqCst);
                let _ = err_tx.send(err);
                return;
            }
            tokio::select! {
                _ = watch_stop.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    });

    Awaiter::new(rx, running, abort, stop).with_failures(err_rx)
}
