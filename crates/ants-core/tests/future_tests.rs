use ants_core::error::AntError;
use ants_core::future::{
    await_all, execute, execute_polling, execute_polling_with_signal, execute_racer,
    execute_watchdog, RaceHandler,
};
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

fn cancel_after(delay: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        sleep(delay).await;
        trigger.cancel();
    });
    token
}

#[tokio::test]
async fn test_execute_returns_handler_result() {
    let token = CancellationToken::new();
    let mut awaiter = execute(&token, |_stop| async move { Ok::<_, AntError>(42) }, None);
    assert_eq!(awaiter.wait(&token).await.unwrap(), 42);
    assert!(!awaiter.is_running());
}

#[tokio::test]
async fn test_execute_cancelled_runs_abort_once() {
    let aborted = Arc::new(AtomicUsize::new(0));
    let counter = aborted.clone();
    let token = cancel_after(Duration::from_millis(10));
    let mut awaiter = execute(
        &token,
        |_stop| async move {
            sleep(Duration::from_secs(30)).await;
            Ok::<_, AntError>(1)
        },
        Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );
    let err = awaiter.wait(&token).await.unwrap_err();
    assert!(err.is_cancellation());
    assert!(awaiter.wait(&token).await.is_err());
    assert_eq!(aborted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_execute_passes_stop_token_to_handler() {
    let observed = Arc::new(AtomicBool::new(false));
    let flag = observed.clone();
    let token = cancel_after(Duration::from_millis(5));
    let mut awaiter = execute(
        &token,
        move |stop| async move {
            stop.cancelled().await;
            flag.store(true, Ordering::SeqCst);
            Ok::<_, AntError>(())
        },
        None,
    );
    assert!(awaiter.wait(&token).await.is_err());
    sleep(Duration::from_millis(20)).await;
    assert!(observed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_polling_completes_and_stops_probing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let token = CancellationToken::new();
    let mut awaiter = execute_polling(
        &token,
        move |_stop| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= 3 {
                    Ok::<_, AntError>(Some(n))
                } else {
                    Ok(None)
                }
            }
        },
        None,
        Duration::from_millis(1),
    );
    assert_eq!(awaiter.wait(&token).await.unwrap(), 3);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_polling_probe_error_stops() {
    let token = CancellationToken::new();
    let mut awaiter = execute_polling(
        &token,
        |_stop| async move { Err::<Option<()>, _>(AntError::Kubernetes("pod failed".into())) },
        None,
        Duration::from_millis(1),
    );
    let err = awaiter.wait(&token).await.unwrap_err();
    assert_eq!(err.to_string(), "Kubernetes error: pod failed");
}

#[tokio::test]
async fn test_polling_cancelled_never_probes_again() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let token = cancel_after(Duration::from_millis(10));
    let mut awaiter = execute_polling(
        &token,
        move |_stop| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<Option<()>, AntError>(None) }
        },
        None,
        Duration::from_millis(1),
    );
    assert!(awaiter.wait(&token).await.unwrap_err().is_cancellation());
    sleep(Duration::from_millis(10)).await;
    let seen = calls.load(Ordering::SeqCst);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), seen);
}

#[tokio::test]
async fn test_polling_signal_wakes_early() {
    let ready = Arc::new(AtomicBool::new(false));
    let probe_ready = ready.clone();
    let token = CancellationToken::new();
    let (mut awaiter, signal) = execute_polling_with_signal(
        &token,
        move |_stop| {
            let ready = probe_ready.load(Ordering::SeqCst);
            async move { Ok::<_, AntError>(if ready { Some("ready") } else { None }) }
        },
        None,
        Duration::from_secs(10),
        Duration::from_secs(60),
    );
    sleep(Duration::from_millis(10)).await;
    ready.store(true, Ordering::SeqCst);
    signal.signal();
    signal.signal();

    let deadline = cancel_after(Duration::from_secs(2));
    assert_eq!(awaiter.wait(&deadline).await.unwrap(), "ready");
}

#[tokio::test]
async fn test_watchdog_error_wins_over_late_success() {
    let token = CancellationToken::new();
    let mut awaiter = execute_watchdog(
        &token,
        |_stop| async move {
            sleep(Duration::from_millis(100)).await;
            Ok::<_, AntError>("done")
        },
        |_stop| async move { Err::<(), _>(AntError::Kubernetes("pod left running phase".into())) },
        None,
        Duration::from_millis(1),
    );
    let err = awaiter.wait(&token).await.unwrap_err();
    assert!(err.to_string().contains("pod left running phase"));
}

#[tokio::test]
async fn test_watchdog_returns_main_result() {
    let probes = Arc::new(AtomicUsize::new(0));
    let counter = probes.clone();
    let token = CancellationToken::new();
    let mut awaiter = execute_watchdog(
        &token,
        |_stop| async move {
            sleep(Duration::from_millis(20)).await;
            Ok::<_, AntError>(7)
        },
        move |_stop| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<(), AntError>(()) }
        },
        None,
        Duration::from_millis(1),
    );
    assert_eq!(awaiter.wait(&token).await.unwrap(), 7);
    assert!(probes.load(Ordering::SeqCst) >= 1);

    sleep(Duration::from_millis(20)).await;
    let after = probes.load(Ordering::SeqCst);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(probes.load(Ordering::SeqCst), after);
}

#[tokio::test]
async fn test_watchdog_cancelled() {
    let token = cancel_after(Duration::from_millis(5));
    let mut awaiter = execute_watchdog(
        &token,
        |stop| async move {
            stop.cancelled().await;
            Ok::<_, AntError>(())
        },
        |_stop| async move { Ok::<(), AntError>(()) },
        None,
        Duration::from_millis(1),
    );
    assert!(awaiter.wait(&token).await.unwrap_err().is_cancellation());
}

fn racer(delay_ms: u64, result: Result<i32, &'static str>) -> RaceHandler<i32> {
    Box::new(move |_stop: CancellationToken| {
        async move {
            sleep(Duration::from_millis(delay_ms)).await;
            result.map_err(|e| AntError::Http(e.to_string()))
        }
        .boxed()
    })
}

#[tokio::test]
async fn test_racer_first_result_wins() {
    let token = CancellationToken::new();
    let mut awaiter = execute_racer(
        &token,
        vec![racer(50, Ok(1)), racer(5, Ok(2)), racer(100, Ok(3))],
        None,
    )
    .unwrap();
    assert_eq!(awaiter.wait(&token).await.unwrap(), 2);
}

#[tokio::test]
async fn test_racer_first_failure_wins() {
    let token = CancellationToken::new();
    let mut awaiter =
        execute_racer(&token, vec![racer(50, Ok(1)), racer(5, Err("refused"))], None).unwrap();
    let err = awaiter.wait(&token).await.unwrap_err();
    assert_eq!(err.to_string(), "HTTP error: refused");
}

#[tokio::test]
async fn test_racer_cancelled_before_any_result() {
    let token = cancel_after(Duration::from_millis(5));
    let mut awaiter =
        execute_racer(&token, vec![racer(1000, Ok(1)), racer(1000, Ok(2))], None).unwrap();
    assert!(awaiter.wait(&token).await.unwrap_err().is_cancellation());
}

#[tokio::test]
async fn test_racer_rejects_handler_count() {
    let token = CancellationToken::new();
    assert!(execute_racer::<i32>(&token, vec![], None).is_err());
    let four = (0..4).map(|i| racer(1, Ok(i))).collect();
    assert!(execute_racer(&token, four, None).is_err());
}

#[tokio::test]
async fn test_await_all_collects_every_outcome() {
    let token = CancellationToken::new();
    let awaiters = vec![
        execute(&token, |_stop| async move { Ok::<_, AntError>(1) }, None),
        execute(
            &token,
            |_stop| async move { Err::<i32, _>(AntError::Docker("volume is in use".into())) },
            None,
        ),
        execute(&token, |_stop| async move { Ok::<_, AntError>(3) }, None),
    ];
    let results = await_all(&token, awaiters).await;
    assert_eq!(results.len(), 3);
    assert_eq!(*results[0].as_ref().unwrap(), 1);
    assert!(results[1].as_ref().unwrap_err().is_retryable());
    assert_eq!(*results[2].as_ref().unwrap(), 3);
}
