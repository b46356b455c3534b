use super::{AbortHandler, Awaiter};
use crate::error::AntError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Wakes a signal-driven polling task ahead of its timer.
#[derive(Clone)]
pub struct PollSignal {
    tx: mpsc::Sender<()>,
}

impl PollSignal {
    /// Non-blocking; a pending signal absorbs further ones.
    pub fn signal(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Polling mode: calls `probe` every `interval` until it reports completion.
///
/// The probe returns `Ok(Some(result))` when done, `Ok(None)` to keep
/// polling and `Err` to stop with that error. Cancellation is checked before
/// each call, so the probe is never invoked once the result was sent.
pub fn execute_polling<T, F, Fut>(
    token: &CancellationToken,
    mut probe: F,
    abort: Option<AbortHandler>,
    interval: Duration,
) -> Awaiter<T>
where
    T: Send + 'static,
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<T>, AntError>> + Send + 'static,
{
    let stop = token.child_token();
    let (tx, rx) = mpsc::channel(1);
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    let child = stop.clone();
    tokio::spawn(async move {
        let res = loop {
            if child.is_cancelled() {
                break Err(AntError::DeadlineExceeded);
            }
            match probe(child.clone()).await {
                Ok(Some(done)) => break Ok(done),
                Ok(None) => {}
                Err(err) => break Err(err),
            }
            tokio::select! {
                _ = child.cancelled() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        };
        flag.store(false, Ordering::SeqCst);
        let _ = tx.send(res).await;
    });
    Awaiter::new(rx, running, abort, stop)
}

/// Polling mode that also wakes on [`PollSignal::signal`].
///
/// The sleep between probes starts at `interval`, doubles after every
/// unsignaled tick up to `max_interval`, and resets to `interval` whenever a
/// signal arrives.
pub fn execute_polling_with_signal<T, F, Fut>(
    token: &CancellationToken,
    mut probe: F,
    abort: Option<AbortHandler>,
    interval: Duration,
    max_interval: Duration,
) -> (Awaiter<T>, PollSignal)
where
    T: Send + 'static,
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<T>, AntError>> + Send + 'static,
{
    let stop = token.child_token();
    let (tx, rx) = mpsc::channel(1);
    let (signal_tx, mut signal_rx) = mpsc::channel::<()>(1);
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    let child = stop.clone();
    let max_interval = max_interval.max(interval);
    tokio::spawn(async move {
        let mut delay = interval;
        let res = loop {
            if child.is_cancelled() {
                break Err(AntError::DeadlineExceeded);
            }
            match probe(child.clone()).await {
                Ok(Some(done)) => break Ok(done),
                Ok(None) => {}
                Err(err) => break Err(err),
            }
            tokio::select! {
                _ = child.cancelled() => {}
                Some(()) = signal_rx.recv() => {
                    delay = interval;
                }
                _ = tokio::time::sleep(delay) => {
                    delay = (delay * 2).min(max_interval);
                }
            }
        };
        flag.store(false, Ordering::SeqCst);
        let _ = tx.send(res).await;
    });
    (
        Awaiter::new(rx, running, abort, stop),
        PollSignal { tx: signal_tx },
    )
}
