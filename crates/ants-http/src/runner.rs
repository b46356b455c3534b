use crate::client::{HttpClient, HttpRequest, HttpResponse};
use ants_core::base::{BaseExecutor, RunnerBase};
use ants_core::error::AntError;
use ants_core::executor::{CommandOutput, CommandRunner};
use ants_core::future::{execute, Awaiter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One request against the URL given as the command. It is sent on its own
/// task so the caller's timeout applies independently of the client's.
pub struct HttpCommandRunner {
    base: RunnerBase,
    status: Arc<AtomicU16>,
    running: Arc<AtomicBool>,
    awaiter: Mutex<Option<Awaiter<HttpResponse>>>,
    cancel: CancellationToken,
}

impl HttpCommandRunner {
    pub(crate) fn start(
        client: HttpClient,
        executor: &BaseExecutor,
        url: &str,
        helper: bool,
        host: &str,
        vars: &HashMap<String, String>,
    ) -> Result<Self, AntError> {
        let request = HttpRequest::for_method(executor.method, vars)?;
        let base = RunnerBase::new(executor, url, helper, host);
        base.write_trace(&format!("$ {}", url));

        let cancel = CancellationToken::new();
        let status = Arc::new(AtomicU16::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let headers = executor.options.headers.clone();
        let query = executor.options.query_params.clone();
        let target = url.to_string();
        let (flag, code) = (running.clone(), status.clone());
        let awaiter = execute(
            &cancel,
            move |stop| async move {
                let result = tokio::select! {
                    _ = stop.cancelled() => Err(AntError::DeadlineExceeded),
                    res = client.send(&target, &headers, &query, &request) => res,
                };
                if let Ok(response) = &result {
                    code.store(response.status, Ordering::SeqCst);
                }
                flag.store(false, Ordering::SeqCst);
                result
            },
            None,
        );
        debug!("Started http request {} method={}", url, executor.method);

        Ok(Self {
            base,
            status,
            running,
            awaiter: Mutex::new(Some(awaiter)),
            cancel,
        })
    }

    /// Status code of the response, 0 until one arrived.
    pub fn http_status(&self) -> u16 {
        self.status.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CommandRunner for HttpCommandRunner {
    fn id(&self) -> &str {
        &self.base.id
    }

    fn command(&self) -> &str {
        &self.base.command
    }

    fn is_helper(&self) -> bool {
        self.base.helper
    }

    async fn wait(&self, token: &CancellationToken) -> Result<CommandOutput, AntError> {
        let mut awaiter = self.awaiter.lock().await.take().ok_or_else(|| {
            AntError::Internal(format!("request '{}' is not running", self.base.command))
        })?;
        let (output, outcome) = match awaiter.wait(token).await {
            Ok(response) => {
                let outcome = if response.is_success() {
                    Ok(())
                } else {
                    Err(AntError::Http(format!(
                        "request for {} failed with status {}",
                        self.base.command, response.status
                    )))
                };
                (
                    CommandOutput {
                        stdout: response.body,
                        stderr: Vec::new(),
                    },
                    outcome,
                )
            }
            Err(err) => (CommandOutput::default(), Err(err)),
        };
        self.base.finish(output, outcome)
    }

    async fn is_running(&self, _token: &CancellationToken) -> Result<bool, AntError> {
        Ok(self.running.load(Ordering::SeqCst))
    }

    async fn stop(&self, _token: &CancellationToken, _timeout: Duration) -> Result<(), AntError> {
        self.cancel.cancel();
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stdout(&self) -> Vec<u8> {
        self.base.stdout()
    }

    fn stderr(&self) -> Vec<u8> {
        self.base.stderr()
    }

    fn exit_code(&self) -> i32 {
        self.base.exit_code()
    }

    fn exit_message(&self) -> String {
        self.base.exit_message()
    }
}
