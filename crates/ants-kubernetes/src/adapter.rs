use ants_core::error::AntError;
use ants_core::executor::CommandOutput;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use std::time::Duration;

/// Result of one remote command in a pod container.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub output: CommandOutput,
    pub exit_code: i32,
    /// Remote status message when `exit_code` is non-zero,
    /// ending in the exit code.
    pub message: String,
}

/// Cluster operations needed by the Kubernetes executor, scoped to the
/// configured namespace.
#[async_trait::async_trait]
pub trait KubernetesAdapter: Send + Sync {
    fn namespace(&self) -> &str;

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, AntError>;

    /// `None` when the pod does not exist.
    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, AntError>;

    async fn delete_pod(&self, name: &str, grace: Duration) -> Result<(), AntError>;

    async fn list_pods(&self) -> Result<Vec<Pod>, AntError>;

    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutcome, AntError>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, AntError>;

    async fn delete_secret(&self, name: &str) -> Result<(), AntError>;

    async fn create_service(&self, service: &Service) -> Result<Service, AntError>;

    async fn delete_service(&self, name: &str) -> Result<(), AntError>;

    /// Recent events of a pod as `type=.. reason=.. message=..` lines.
    async fn events(&self, pod: &str) -> Result<Vec<String>, AntError>;

    async fn logs(&self, pod: &str, limit_bytes: i64) -> Result<String, AntError>;
}
