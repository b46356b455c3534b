use ants_core::config::AntConfig;
use ants_core::error::AntError;
use ants_core::executor::{Executor, ExecutorInfo, ExecutorProvider};
use ants_core::options::ExecutorOptions;
use ants_core::trace::JobTrace;
use ants_core::types::TaskMethod;
use ants_docker::DockerProvider;
use ants_http::HttpProvider;
use ants_kubernetes::KubernetesProvider;
use ants_shell::ShellProvider;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Methods whose containers are swept by the registry and the reaper.
pub const CONTAINER_METHODS: [TaskMethod; 3] =
    [TaskMethod::Shell, TaskMethod::Docker, TaskMethod::Kubernetes];

/// Dispatches executor requests to the provider registered for the task
/// method.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<TaskMethod, Arc<dyn ExecutorProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the providers for every method the ant is configured with.
    /// A backend that cannot be reached is logged and left out.
    pub async fn connect(config: Arc<AntConfig>) -> Result<Self, AntError> {
        let mut registry = Self::new();
        let wants = |m: TaskMethod| config.methods.contains(&m);

        if wants(TaskMethod::Shell) {
            registry.register(&[TaskMethod::Shell], Arc::new(ShellProvider::new(config.clone())));
        }
        if wants(TaskMethod::Docker) {
            match DockerProvider::new(config.clone()) {
                Ok(provider) => registry.register(&[TaskMethod::Docker], Arc::new(provider)),
                Err(err) => warn!("Docker provider is not available: {}", err),
            }
        }
        if wants(TaskMethod::Kubernetes) {
            match KubernetesProvider::new(config.clone()).await {
                Ok(provider) => registry.register(&[TaskMethod::Kubernetes], Arc::new(provider)),
                Err(err) => warn!("Kubernetes provider is not available: {}", err),
            }
        }
        let http: Vec<TaskMethod> = config.methods.iter().copied().filter(|m| m.is_http()).collect();
        if !http.is_empty() {
            registry.register(&http, Arc::new(HttpProvider::new(config.clone())?));
        }
        info!("Provider registry ready methods={:?}", registry.methods());
        Ok(registry)
    }

    pub fn register(&mut self, methods: &[TaskMethod], provider: Arc<dyn ExecutorProvider>) {
        for method in methods {
            self.providers.insert(*method, provider.clone());
        }
    }

    pub fn methods(&self) -> Vec<TaskMethod> {
        let mut methods: Vec<TaskMethod> = self.providers.keys().copied().collect();
        methods.sort_by_key(|m| m.as_str());
        methods
    }

    pub fn provider(&self, method: TaskMethod) -> Result<Arc<dyn ExecutorProvider>, AntError> {
        self.providers
            .get(&method)
            .cloned()
            .ok_or_else(|| AntError::UnsupportedMethod(format!("unsupported method {}", method)))
    }

    pub async fn new_executor(
        &self,
        token: &CancellationToken,
        trace: Arc<dyn JobTrace>,
        opts: ExecutorOptions,
    ) -> Result<Arc<dyn Executor>, AntError> {
        let provider = self.provider(opts.method()?)?;
        provider.new_executor(token, trace, opts).await
    }

    /// Stops a container through its method's provider. Providers resolve
    /// `id` as an executor id first and then as a container name.
    pub async fn stop_container(
        &self,
        token: &CancellationToken,
        method: TaskMethod,
        id: &str,
    ) -> Result<(), AntError> {
        let opts = ExecutorOptions::new(id, method);
        self.provider(method)?.stop_executor(token, id, &opts).await
    }

    /// Running containers of every container backend. Backends that fail to
    /// answer are skipped.
    pub async fn all_running_containers(
        &self,
        token: &CancellationToken,
    ) -> HashMap<TaskMethod, Vec<ExecutorInfo>> {
        let mut res = HashMap::new();
        for method in CONTAINER_METHODS {
            let Some(provider) = self.providers.get(&method) else {
                continue;
            };
            match provider.all_running_executors(token).await {
                Ok(containers) => {
                    debug!("Found {} running {} containers", containers.len(), method);
                    res.insert(method, containers);
                }
                Err(err) => warn!("Failed to list running {} containers: {}", method, err),
            }
        }
        res
    }
}
