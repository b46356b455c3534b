use crate::adapter::KubernetesAdapter;
use crate::executor::KubernetesExecutor;
use crate::kube_adapter::KubeAdapter;
use crate::pod::registry_secret;
use crate::pods::PodClient;
use ants_core::base::ExecutorMap;
use ants_core::config::AntConfig;
use ants_core::error::AntError;
use ants_core::executor::{Executor, ExecutorInfo, ExecutorProvider};
use ants_core::options::ExecutorOptions;
use ants_core::trace::{JobTrace, TraceTag};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Creates and tracks [`KubernetesExecutor`]s in one namespace.
pub struct KubernetesProvider {
    config: Arc<AntConfig>,
    pods: PodClient,
    executors: ExecutorMap<KubernetesExecutor>,
    credentials: Mutex<Option<String>>,
}

impl KubernetesProvider {
    pub async fn new(config: Arc<AntConfig>) -> Result<Self, AntError> {
        let adapter = Arc::new(KubeAdapter::connect(&config.kubernetes).await?);
        Ok(Self::with_adapter(config, adapter))
    }

    pub fn with_adapter(config: Arc<AntConfig>, adapter: Arc<dyn KubernetesAdapter>) -> Self {
        Self {
            pods: PodClient::new(adapter, config.clone()),
            config,
            executors: ExecutorMap::new(),
            credentials: Mutex::new(None),
        }
    }

    /// Name of the image pull secret for the configured registry, created on
    /// first use. `None` without registry credentials.
    async fn registry_credentials(&self) -> Result<Option<String>, AntError> {
        if !self.config.kubernetes.registry.has_credentials() {
            return Ok(None);
        }
        let mut credentials = self.credentials.lock().await;
        if let Some(name) = credentials.as_ref() {
            return Ok(Some(name.clone()));
        }
        let secret = registry_secret(&self.config.kubernetes)?;
        let created = self.pods.adapter().create_secret(&secret).await?;
        let name = created.metadata.name.unwrap_or_default();
        info!(
            "Created registry credentials {} for {}",
            name, self.config.kubernetes.registry.server
        );
        *credentials = Some(name.clone());
        Ok(Some(name))
    }

    /// Deletes the registry credentials secret.
    pub async fn dispose(&self) -> Result<(), AntError> {
        let Some(name) = self.credentials.lock().await.take() else {
            return Ok(());
        };
        self.pods.adapter().delete_secret(&name).await
    }
}

#[async_trait::async_trait]
impl ExecutorProvider for KubernetesProvider {
    async fn new_executor(
        &self,
        _token: &CancellationToken,
        trace: Arc<dyn JobTrace>,
        opts: ExecutorOptions,
    ) -> Result<Arc<dyn Executor>, AntError> {
        let credentials = match self.registry_credentials().await {
            Ok(credentials) => credentials,
            Err(err) => {
                trace.writeln(
                    &format!("failed to setup registry credentials due to {}", err),
                    TraceTag::Exec,
                );
                return Err(AntError::Kubernetes(format!(
                    "setting up registry credentials due to {}",
                    err
                )));
            }
        };
        let executor = Arc::new(KubernetesExecutor::new(
            self.config.clone(),
            trace,
            opts,
            self.pods.clone(),
            credentials,
        )?);
        self.executors.add(executor.clone()).await;
        Ok(executor)
    }

    /// Pods this provider did not create are deleted by name.
    async fn stop_executor(
        &self,
        token: &CancellationToken,
        id: &str,
        _opts: &ExecutorOptions,
    ) -> Result<(), AntError> {
        match self.executors.take(id).await {
            Some(executor) => executor.stop(token).await,
            None => {
                warn!("Stopping unknown pod {}", id);
                self.pods.delete(id).await
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
        self.pods.list().await
    }
}
