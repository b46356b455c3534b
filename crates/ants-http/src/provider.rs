use crate::client::HttpClient;
use crate::executor::HttpExecutor;
use ants_core::base::ExecutorMap;
use ants_core::config::AntConfig;
use ants_core::error::AntError;
use ants_core::executor::{Executor, ExecutorInfo, ExecutorProvider};
use ants_core::options::ExecutorOptions;
use ants_core::trace::JobTrace;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Creates and tracks [`HttpExecutor`]s over one shared client.
pub struct HttpProvider {
    config: Arc<AntConfig>,
    client: HttpClient,
    executors: ExecutorMap<HttpExecutor>,
}

impl HttpProvider {
    pub fn new(config: Arc<AntConfig>) -> Result<Self, AntError> {
        let client = HttpClient::new(&config.user_agent)?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: Arc<AntConfig>, client: HttpClient) -> Self {
        Self {
            config,
            client,
            executors: ExecutorMap::new(),
        }
    }
}

#[async_trait::async_trait]
impl ExecutorProvider for HttpProvider {
    async fn new_executor(
        &self,
        _token: &CancellationToken,
        trace: Arc<dyn JobTrace>,
        opts: ExecutorOptions,
    ) -> Result<Arc<dyn Executor>, AntError> {
        let executor = Arc::new(
            HttpExecutor::new(self.config.clone(), trace, opts, self.client.clone()).await?,
        );
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
        info!("Stopping http executor {} ({})", id, executor.name());
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
