use crate::adapter::{ExecOutcome, KubernetesAdapter};
use ants_core::config::KubernetesConfig;
use ants_core::error::AntError;
use ants_core::executor::CommandOutput;
use k8s_openapi::api::core::v1::{Event, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

fn kube_err(action: &str, err: kube::Error) -> AntError {
    AntError::Kubernetes(format!("{} due to {}", action, err))
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Exit code of a finished exec from its remote status, 0 on success.
pub fn exit_code_from_status(status: &Status) -> i32 {
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
                .and_then(|c| c.message.as_ref())
                .and_then(|m| m.trim().parse().ok())
        })
        .unwrap_or(1)
}

async fn read_all(reader: Option<impl AsyncRead + Unpin>) -> Result<Vec<u8>, AntError> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// [`KubernetesAdapter`] over a `kube` client.
pub struct KubeAdapter {
    client: Client,
    namespace: String,
}

impl KubeAdapter {
    /// Uses the configured kubeconfig and context, or infers the in-cluster
    /// or local configuration.
    pub async fn connect(config: &KubernetesConfig) -> Result<Self, AntError> {
        let options = KubeConfigOptions {
            context: config.context.clone(),
            ..KubeConfigOptions::default()
        };
        let client_config = match &config.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    AntError::Config(format!("failed to read kubeconfig {:?}: {}", path, e))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| AntError::Config(format!("invalid kubeconfig: {}", e)))?
            }
            None if config.context.is_some() => Config::from_kubeconfig(&options)
                .await
                .map_err(|e| AntError::Config(format!("invalid kubeconfig: {}", e)))?,
            None => Config::infer().await.map_err(|e| {
                AntError::Config(format!("failed to create kubernetes config: {}", e))
            })?,
        };
        info!(
            "Kubernetes client connecting cluster={} namespace={}",
            client_config.cluster_url, config.namespace
        );
        let client = Client::try_from(client_config)
            .map_err(|e| kube_err("failed to create kubernetes client", e))?;
        Ok(Self::with_client(client, &config.namespace))
    }

    pub fn with_client(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait::async_trait]
impl KubernetesAdapter for KubeAdapter {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, AntError> {
        self.pods()
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| kube_err("failed to create pod", e))
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, AntError> {
        self.pods()
            .get_opt(name)
            .await
            .map_err(|e| kube_err(&format!("failed to get pod {}", name), e))
    }

    async fn delete_pod(&self, name: &str, grace: Duration) -> Result<(), AntError> {
        let params = DeleteParams {
            grace_period_seconds: Some(grace.as_secs() as u32),
            ..DeleteParams::default()
        };
        self.pods()
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(|e| kube_err(&format!("failed to delete pod {}", name), e))
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, AntError> {
        Ok(self
            .pods()
            .list(&ListParams::default())
            .await
            .map_err(|e| kube_err("failed to list containers", e))?
            .items)
    }

    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutcome, AntError> {
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut attached = self
            .pods()
            .exec(pod, command, &params)
            .await
            .map_err(|e| kube_err(&format!("failed to exec in pod {}", pod), e))?;
        let status = attached.take_status();
        let out = attached.stdout();
        let err = attached.stderr();
        let (stdout, stderr) = tokio::try_join!(read_all(out), read_all(err))?;
        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| AntError::Kubernetes(format!("exec stream in pod {} failed: {}", pod, e)))?;

        let exit_code = status.as_ref().map(exit_code_from_status).unwrap_or(0);
        let message = if exit_code == 0 {
            String::new()
        } else {
            let detail = status
                .as_ref()
                .and_then(|s| s.message.clone())
                .unwrap_or_default();
            format!("command terminated: {} exit code {}", detail, exit_code)
        };
        debug!("Exec in {}/{} finished exit-code={}", pod, container, exit_code);
        Ok(ExecOutcome {
            output: CommandOutput { stdout, stderr },
            exit_code,
            message,
        })
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, AntError> {
        self.secrets()
            .create(&PostParams::default(), secret)
            .await
            .map_err(|e| kube_err("failed to create secret", e))
    }

    async fn delete_secret(&self, name: &str) -> Result<(), AntError> {
        self.secrets()
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| kube_err("error cleaning up secrets", e))
    }

    async fn create_service(&self, service: &Service) -> Result<Service, AntError> {
        self.services()
            .create(&PostParams::default(), service)
            .await
            .map_err(|e| kube_err("failed to create service", e))
    }

    async fn delete_service(&self, name: &str) -> Result<(), AntError> {
        match self.services().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(kube_err(&format!("failed to delete service {}", name), e)),
        }
    }

    async fn events(&self, pod: &str) -> Result<Vec<String>, AntError> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams::default().fields(&format!("involvedObject.name={}", pod));
        let events = api
            .list(&params)
            .await
            .map_err(|e| kube_err(&format!("failed to get events for {}", pod), e))?;
        Ok(events
            .items
            .iter()
            .map(|ev| {
                format!(
                    "type={} reason={} message={}",
                    ev.type_.as_deref().unwrap_or(""),
                    ev.reason.as_deref().unwrap_or(""),
                    ev.message.as_deref().unwrap_or("")
                )
            })
            .collect())
    }

    async fn logs(&self, pod: &str, limit_bytes: i64) -> Result<String, AntError> {
        let params = LogParams {
            limit_bytes: Some(limit_bytes),
            ..LogParams::default()
        };
        self.pods()
            .logs(pod, &params)
            .await
            .map_err(|e| kube_err(&format!("failed to get logs for {}", pod), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};

    #[test]
    fn test_exit_code_from_status() {
        let ok = Status {
            status: Some("Success".into()),
            ..Status::default()
        };
        assert_eq!(exit_code_from_status(&ok), 0);

        let failed = Status {
            status: Some("Failure".into()),
            reason: Some("NonZeroExitCode".into()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".into()),
                    message: Some("127".into()),
                    ..StatusCause::default()
                }]),
                ..StatusDetails::default()
            }),
            ..Status::default()
        };
        assert_eq!(exit_code_from_status(&failed), 127);

        let unknown = Status {
            status: Some("Failure".into()),
            ..Status::default()
        };
        assert_eq!(exit_code_from_status(&unknown), 1);
    }
}
