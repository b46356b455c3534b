//! Cancellable futures for long-lived backend operations.
//!
//! Every mode spawns its work on its own tokio task and hands back an
//! [`Awaiter`]. `wait` resolves with the task's result, or with
//! [`AntError::DeadlineExceeded`] as soon as the caller's token fires. The
//! spawned task is never aborted; it receives a child token and is expected
//! to observe cancellation itself. An optional [`AbortHandler`] runs once on
//! the cancellation path as advisory cleanup only: adapters must still be
//! stopped explicitly to release backend resources.

mod polling;
mod racer;
mod watchdog;

pub use polling::{execute_polling, execute_polling_with_signal, PollSignal};
pub use racer::{execute_racer, RaceHandler};
pub use watchdog::execute_watchdog;

use crate::error::AntError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Best-effort cleanup invoked when the caller cancels a pending `wait`.
pub type AbortHandler = Box<dyn FnOnce() + Send>;

/// Handle to one concurrent task. Delivers exactly one result.
pub struct Awaiter<T> {
    results: mpsc::Receiver<Result<T, AntError>>,
    failures: Option<oneshot::Receiver<AntError>>,
    running: Arc<AtomicBool>,
    abort: Option<AbortHandler>,
    stop: CancellationToken,
    delivered: bool,
}

impl<T> Awaiter<T> {
    pub(crate) fn new(
        results: mpsc::Receiver<Result<T, AntError>>,
        running: Arc<AtomicBool>,
        abort: Option<AbortHandler>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            results,
            failures: None,
            running,
            abort,
            stop,
            delivered: false,
        }
    }

    pub(crate) fn with_failures(mut self, failures: oneshot::Receiver<AntError>) -> Self {
        self.failures = Some(failures);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Blocks until the task yields or `token` is cancelled.
    ///
    /// Cancellation is checked first, so once `token` has fired every call
    /// returns `DeadlineExceeded`. A watchdog failure takes precedence over
    /// a main result that became ready at the same time.
    pub async fn wait(&mut self, token: &CancellationToken) -> Result<T, AntError> {
        if self.delivered && !token.is_cancelled() {
            return Err(AntError::Internal("result was already delivered".into()));
        }
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.stop.cancel();
                if let Some(abort) = self.abort.take() {
                    abort();
                }
                return Err(AntError::DeadlineExceeded);
            }
            err = next_failure(&mut self.failures) => Err(err),
            res = self.results.recv() => match res {
                Some(res) => res,
                None => Err(AntError::Internal("task finished without a result".into())),
            },
        };
        self.delivered = true;
        outcome
    }
}

async fn next_failure(failures: &mut Option<oneshot::Receiver<AntError>>) -> AntError {
    let received = match failures.as_mut() {
        Some(rx) => rx.await.ok(),
        None => None,
    };
    *failures = None;
    match received {
        Some(err) => err,
        None => std::future::pending().await,
    }
}

/// One-shot mode: runs `handler` on its own task.
pub fn execute<T, F, Fut>(
    token: &CancellationToken,
    handler: F,
    abort: Option<AbortHandler>,
) -> Awaiter<T>
where
    T: Send + 'static,
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, AntError>> + Send + 'static,
{
    let stop = token.child_token();
    let (tx, rx) = mpsc::channel(1);
    let running = Arc::new(AtomicBool::new(true));
    let work = handler(stop.clone());
    let flag = running.clone();
    tokio::spawn(async move {
        let res = work.await;
        flag.store(false, Ordering::SeqCst);
        let _ = tx.send(res).await;
    });
    Awaiter::new(rx, running, abort, stop)
}

/// Waits on each awaiter in order and collects every outcome.
pub async fn await_all<T>(
    token: &CancellationToken,
    awaiters: Vec<Awaiter<T>>,
) -> Vec<Result<T, AntError>> {
    let mut results = Vec::with_capacity(awaiters.len());
    for mut next in awaiters {
        results.push(next.wait(token).await);
    }
    results
}
