use crate::adapter::DockerAdapter;
use crate::bollard_adapter::BollardAdapter;
use crate::executor::DockerExecutor;
use ants_core::base::ExecutorMap;
use ants_core::config::AntConfig;
use ants_core::error::AntError;
use ants_core::executor::{Executor, ExecutorInfo, ExecutorProvider};
use ants_core::options::ExecutorOptions;
use ants_core::trace::JobTrace;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Creates and tracks [`DockerExecutor`]s over one shared adapter.
pub struct DockerProvider {
    config: Arc<AntConfig>,
    adapter: Arc<dyn DockerAdapter>,
    executors: ExecutorMap<DockerExecutor>,
}

impl DockerProvider {
    /// Connects to the daemon named in the docker config.
    pub fn new(config: Arc<AntConfig>) -> Result<Self, AntError> {
        info!("Docker client connecting host={}", config.docker.host);
        let adapter = Arc::new(BollardAdapter::connect(config.docker.clone())?);
        Ok(Self::with_adapter(config, adapter))
    }

    pub fn with_adapter(config: Arc<AntConfig>, adapter: Arc<dyn DockerAdapter>) -> Self {
        Self {
            config,
            adapter,
            executors: ExecutorMap::new(),
        }
    }
}

#[async_trait::async_trait]
impl ExecutorProvider for DockerProvider {
    async fn new_executor(
        &self,
        _token: &CancellationToken,
        trace: Arc<dyn JobTrace>,
        opts: ExecutorOptions,
    ) -> Result<Arc<dyn Executor>, AntError> {
        let executor = Arc::new(
            DockerExecutor::new(self.config.clone(), trace, opts, self.adapter.clone()).await?,
        );
        self.executors.add(executor.clone()).await;
        Ok(executor)
    }

    /// Containers this provider did not create are removed through the adapter.
    async fn stop_executor(
        &self,
        token: &CancellationToken,
        id: &str,
        opts: &ExecutorOptions,
    ) -> Result<(), AntError> {
        match self.executors.take(id).await {
            Some(executor) => executor.stop(token).await,
            None => {
                warn!("Stopping unknown container {}", id);
                self.adapter
                    .stop(id, opts, self.config.termination_grace_period())
                    .await
            }
        }
    }

    async fn list_executors(&self) -> Vec<ExecutorInfo> {
        self.executors.infos().await
    }

    async fn all_running_executors(
        &self,
        _token: &CancellationToken,
    ) -> Result<Vec<ExecutorInfo>, AntError> {
        self.adapter.list().await
    }
}
