use crate::client::HttpClient;
use crate::runner::HttpCommandRunner;
use ants_core::base::BaseExecutor;
use ants_core::config::AntConfig;
use ants_core::error::AntError;
use ants_core::executor::{CommandRunner, Executor, ExecutorInfo};
use ants_core::options::ExecutorOptions;
use ants_core::state::State;
use ants_core::trace::JobTrace;
use ants_core::types::TaskMethod;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Executor for the HTTP task methods. There is no backend resource: each
/// command is a URL requested with the task's method.
pub struct HttpExecutor {
    base: BaseExecutor,
    client: HttpClient,
    runners: Mutex<Vec<Arc<HttpCommandRunner>>>,
}

impl HttpExecutor {
    pub async fn new(
        config: Arc<AntConfig>,
        trace: Arc<dyn JobTrace>,
        options: ExecutorOptions,
        client: HttpClient,
    ) -> Result<Self, AntError> {
        let ant_id = config.id.clone();
        let base = BaseExecutor::new(uuid::Uuid::new_v4().to_string(), config, trace, options)?;
        if !base.method.is_http() {
            return Err(AntError::UnsupportedMethod(format!(
                "unsupported http protocol {}",
                base.method
            )));
        }
        base.write_trace(&format!("running with ant {}", ant_id));
        base.write_trace_info("preparing http executor");
        info!("HTTP executor {} created for {}", base.id, base.name);
        Ok(Self {
            base,
            client,
            runners: Mutex::new(Vec::new()),
        })
    }

    async fn spawn(
        &self,
        url: &str,
        helper: bool,
        vars: &HashMap<String, String>,
    ) -> Result<Arc<dyn CommandRunner>, AntError> {
        let mut runners = self.runners.lock().await;
        self.base.begin_execute(url).await?;
        let host = self.base.host().await;
        let runner = Arc::new(HttpCommandRunner::start(
            self.client.clone(),
            &self.base,
            url,
            helper,
            &host,
            vars,
        )?);
        runners.push(runner.clone());
        Ok(runner)
    }
}

#[async_trait::async_trait]
impl Executor for HttpExecutor {
    fn id(&self) -> &str {
        &self.base.id
    }

    fn name(&self) -> &str {
        &self.base.name
    }

    fn method(&self) -> TaskMethod {
        self.base.method
    }

    fn trace(&self) -> Arc<dyn JobTrace> {
        self.base.trace.clone()
    }

    async fn state(&self) -> State {
        self.base.state().await
    }

    async fn info(&self) -> ExecutorInfo {
        self.base.info().await
    }

    async fn async_execute(
        &self,
        _token: &CancellationToken,
        cmd: &str,
        vars: &HashMap<String, String>,
    ) -> Result<Arc<dyn CommandRunner>, AntError> {
        self.spawn(cmd, false, vars).await
    }

    async fn async_helper_execute(
        &self,
        _token: &CancellationToken,
        cmd: &str,
        vars: &HashMap<String, String>,
    ) -> Result<Arc<dyn CommandRunner>, AntError> {
        self.spawn(cmd, true, vars).await
    }

    async fn stop(&self, token: &CancellationToken) -> Result<(), AntError> {
        let mut runners = self.runners.lock().await;
        self.base.begin_stop().await?;
        self.base
            .write_trace(&format!("stopping runners={}", runners.len()));

        let grace = self.base.config.termination_grace_period();
        let mut errors = Vec::new();
        for runner in runners.drain(..) {
            if let Err(err) = runner.stop(token, grace).await {
                warn!("Failed to stop http runner {}: {}", runner.id(), err);
                errors.push(err);
            }
        }
        let result = AntError::aggregate(errors);
        let elapsed = self.base.elapsed(self.base.ended_at().await);
        match &result {
            Ok(()) => self.base.write_trace_info(&format!(
                "stopped http-container: Elapsed={} StopWait={:?}",
                elapsed, grace
            )),
            Err(err) => self.base.write_trace_error(&format!(
                "stopped http-container: Error={} Elapsed={} StopWait={:?}",
                err, elapsed, grace
            )),
        }
        result
    }

    async fn runtime_info(&self, _token: &CancellationToken) -> String {
        let runners = self.runners.lock().await;
        let mut out = format!(
            "HTTP ID={} Name={} Runners={}\n",
            self.base.id,
            self.base.name,
            runners.len()
        );
        for runner in runners.iter() {
            out.push_str(&format!(
                "$ {} HTTPCode={}\n",
                runner.command(),
                runner.http_status()
            ));
        }
        out
    }
}
