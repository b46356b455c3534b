use crate::executor::ShellExecutor;
use ants_core::base::ExecutorMap;
use ants_core::config::AntConfig;
use ants_core::error::AntError;
use ants_core::executor::{Executor, ExecutorInfo, ExecutorProvider};
use ants_core::options::ExecutorOptions;
use ants_core::trace::JobTrace;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Creates and tracks [`ShellExecutor`]s.
pub struct ShellProvider {
    config: Arc<AntConfig>,
    executors: ExecutorMap<ShellExecutor>,
}

impl ShellProvider {
    pub fn new(config: Arc<AntConfig>) -> Self {
        Self {
            config,
            executors: ExecutorMap::new(),
        }
    }
}

#[async_trait::async_trait]
impl ExecutorProvider for ShellProvider {
    async fn new_executor(
        &self,
        _token: &CancellationToken,
        trace: Arc<dyn JobTrace>,
        opts: ExecutorOptions,
    ) -> Result<Arc<dyn Executor>, AntError> {
        let executor = Arc::new(ShellExecutor::new(self.config.clone(), trace, opts).await?);
        self.executors.add(executor.clone()).await;
        Ok(executor)
    }

    async fn stop_executor(
        &self,
        token: &CancellationToken,
        id: &str,
        _opts: &ExecutorOptions,
    ) -> Result<(), AntError> {
        let executor = self
            .executors
            .take(id)
            .await
            .ok_or_else(|| AntError::NotFound(format!("failed to find executor with id {}", id)))?;
        info!("Stopping shell executor {} ({})", id, executor.name());
        executor.stop(token).await
    }

    async fn list_executors(&self) -> Vec<ExecutorInfo> {
        self.executors.infos().await
    }

    async fn all_running_executors(
        &self,
        _token: &CancellationToken,
    ) -> Result<Vec<ExecutorInfo>, AntError> {
        Ok(self.executors.infos().await)
    }
}
