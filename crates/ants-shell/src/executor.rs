use crate::runner::ShellCommandRunner;
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
use tracing::{debug, info, warn};

pub(crate) fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Executor that runs every command on the ant's own host.
pub struct ShellExecutor {
    base: BaseExecutor,
    runners: Mutex<Vec<Arc<ShellCommandRunner>>>,
}

impl ShellExecutor {
    pub async fn new(
        config: Arc<AntConfig>,
        trace: Arc<dyn JobTrace>,
        options: ExecutorOptions,
    ) -> Result<Self, AntError> {
        let base = BaseExecutor::new(uuid::Uuid::new_v4().to_string(), config, trace, options)?;
        base.set_host(&hostname(), "127.0.0.1").await;
        info!("Shell executor {} created for {}", base.id, base.name);
        Ok(Self {
            base,
            runners: Mutex::new(Vec::new()),
        })
    }

    async fn spawn(
        &self,
        token: &CancellationToken,
        cmd: &str,
        helper: bool,
        vars: &HashMap<String, String>,
    ) -> Result<Arc<dyn CommandRunner>, AntError> {
        // held across the state check so stop() cannot miss a new runner
        let mut runners = self.runners.lock().await;
        self.base.begin_execute(cmd).await?;
        let host = self.base.host().await;
        let runner = Arc::new(ShellCommandRunner::spawn(
            token, &self.base, cmd, helper, &host, vars,
        )?);
        runners.push(runner.clone());
        Ok(runner)
    }
}

#[async_trait::async_trait]
impl Executor for ShellExecutor {
    fn id(&self) -> &str {
        &self.base.id
    }

    fn name(&self) -> &str {
        &self.base.name
    }

    fn method(&self) -> TaskMethod {
        TaskMethod::Shell
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
        token: &CancellationToken,
        cmd: &str,
        vars: &HashMap<String, String>,
    ) -> Result<Arc<dyn CommandRunner>, AntError> {
        self.spawn(token, cmd, false, vars).await
    }

    async fn async_helper_execute(
        &self,
        token: &CancellationToken,
        cmd: &str,
        vars: &HashMap<String, String>,
    ) -> Result<Arc<dyn CommandRunner>, AntError> {
        self.spawn(token, cmd, true, vars).await
    }

    async fn stop(&self, token: &CancellationToken) -> Result<(), AntError> {
        let mut runners = self.runners.lock().await;
        self.base.begin_stop().await?;
        self.base
            .write_trace_info(&format!("stopping shell executor with {} runners", runners.len()));

        let grace = self.base.config.termination_grace_period();
        let mut errors = Vec::new();
        for runner in runners.drain(..) {
            if let Err(err) = runner.stop(token, grace).await {
                if !err.to_string().contains("process already finished") {
                    warn!("Failed to stop runner {}: {}", runner.id(), err);
                    errors.push(err);
                }
            }
        }

        let ended_at = self.base.ended_at().await;
        let result = AntError::aggregate(errors);
        match &result {
            Ok(()) => self.base.write_trace_success(&format!(
                "stopped executor Elapsed={}",
                self.base.elapsed(ended_at)
            )),
            Err(err) => self.base.write_trace_error(&format!(
                "stopped executor Error={} Elapsed={}",
                err,
                self.base.elapsed(ended_at)
            )),
        }
        debug!("Shell executor {} stopped", self.base);
        result
    }

    async fn runtime_info(&self, _token: &CancellationToken) -> String {
        let runners = self.runners.lock().await;
        let mut out = format!(
            "Shell ID={} Name={} Runners={}\n",
            self.base.id,
            self.base.name,
            runners.len()
        );
        for runner in runners.iter() {
            out.push_str(&format!("$ {} PID={}\n", runner.command(), runner.pid()));
        }
        out
    }
}
