use super::{AbortHandler, Awaiter};
use crate::error::AntError;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type RaceHandler<T> =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<T, AntError>> + Send>;

const MAX_RACERS: usize = 3;

/// Racer mode: runs up to three handlers; the first result of any kind wins.
///
/// Losing handlers are left to finish in place and their results dropped.
pub fn execute_racer<T>(
    token: &CancellationToken,
    handlers: Vec<RaceHandler<T>>,
    abort: Option<AbortHandler>,
) -> Result<Awaiter<T>, AntError>
where
    T: Send + 'static,
{
    if handlers.is_empty() || handlers.len() > MAX_RACERS {
        return Err(AntError::Validation(format!(
            "unsupported number of handlers {}",
            handlers.len()
        )));
    }
    let stop = token.child_token();
    let (tx, rx) = mpsc::channel(handlers.len());
    let running = Arc::new(AtomicBool::new(true));
    for handler in handlers {
        let work = handler(stop.clone());
        let tx = tx.clone();
        let flag = running.clone();
        tokio::spawn(async move {
            let res = work.await;
            flag.store(false, Ordering::SeqCst);
            let _ = tx.send(res).await;
        });
    }
    Ok(Awaiter::new(rx, running, abort, stop))
}
