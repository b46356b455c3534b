use crate::error::AntError;
use crate::options::ExecutorOptions;
use crate::state::State;
use crate::trace::JobTrace;
use crate::types::TaskMethod;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Captured output of one finished command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Point-in-time description of a live or discovered executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorInfo {
    pub id: String,
    pub name: String,
    pub method: TaskMethod,
    pub state: State,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub host: String,
    pub container_ip: String,
}

impl ExecutorInfo {
    /// Seconds since start, or the full run time once ended.
    pub fn elapsed_secs(&self) -> i64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_seconds()
    }
}

/// One command invocation inside an executor.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    fn id(&self) -> &str;

    fn command(&self) -> &str;

    fn is_helper(&self) -> bool;

    /// Blocks until the command finishes or `token` fires, then flushes output to the trace.
    ///
    /// `exit_code()` is 0 exactly when this returns `Ok`.
    async fn wait(&self, token: &CancellationToken) -> Result<CommandOutput, AntError>;

    async fn is_running(&self, token: &CancellationToken) -> Result<bool, AntError>;

    async fn stop(&self, token: &CancellationToken, timeout: Duration) -> Result<(), AntError>;

    /// Output captured so far; empty until `wait` has collected it.
    fn stdout(&self) -> Vec<u8>;

    fn stderr(&self) -> Vec<u8>;

    fn exit_code(&self) -> i32;

    fn exit_message(&self) -> String;
}

/// A live execution context bound to one task.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn helper_name(&self) -> String {
        format!("{}-helper", self.name())
    }

    fn method(&self) -> TaskMethod;

    fn trace(&self) -> Arc<dyn JobTrace>;

    async fn state(&self) -> State;

    async fn info(&self) -> ExecutorInfo;

    /// Starts `cmd` on the main container. Fails with `AlreadyStopped` once
    /// the executor is being removed.
    async fn async_execute(
        &self,
        token: &CancellationToken,
        cmd: &str,
        vars: &HashMap<String, String>,
    ) -> Result<Arc<dyn CommandRunner>, AntError>;

    /// Starts `cmd` on the helper container.
    async fn async_helper_execute(
        &self,
        token: &CancellationToken,
        cmd: &str,
        vars: &HashMap<String, String>,
    ) -> Result<Arc<dyn CommandRunner>, AntError>;

    async fn stop(&self, token: &CancellationToken) -> Result<(), AntError>;

    /// Diagnostic dump of the backend resource.
    async fn runtime_info(&self, token: &CancellationToken) -> String;
}

/// Per-backend factory and tracker of live executors.
#[async_trait::async_trait]
pub trait ExecutorProvider: Send + Sync {
    async fn new_executor(
        &self,
        token: &CancellationToken,
        trace: Arc<dyn JobTrace>,
        opts: ExecutorOptions,
    ) -> Result<Arc<dyn Executor>, AntError>;

    async fn stop_executor(
        &self,
        token: &CancellationToken,
        id: &str,
        opts: &ExecutorOptions,
    ) -> Result<(), AntError>;

    /// Executors created through this provider.
    async fn list_executors(&self) -> Vec<ExecutorInfo>;

    /// Every running resource the backend knows about, including ones left by
    /// other processes.
    async fn all_running_executors(
        &self,
        token: &CancellationToken,
    ) -> Result<Vec<ExecutorInfo>, AntError>;
}
