use crate::pod::build_pod;
use crate::pods::PodClient;
use crate::runner::KubernetesCommandRunner;
use ants_core::base::BaseExecutor;
use ants_core::config::AntConfig;
use ants_core::error::AntError;
use ants_core::executor::{CommandRunner, Executor, ExecutorInfo};
use ants_core::options::{add_from_env_command, ExecutorOptions};
use ants_core::state::State;
use ants_core::trace::JobTrace;
use ants_core::types::TaskMethod;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const MAX_BUILD_POD_TRIES: u32 = 10;
const BUILD_POD_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The pod created for an executor, set once it is running.
#[derive(Debug, Clone, Default)]
pub(crate) struct Deployment {
    pub pod_name: String,
    pub uid: String,
    pub containers: usize,
    pub service_names: Vec<String>,
    pub kube_services: Vec<String>,
    pub cost: f64,
}

/// Executor state shared with its runners.
pub(crate) struct KubernetesPod {
    pub base: BaseExecutor,
    pub pods: PodClient,
    credentials: Option<String>,
    deployment: RwLock<Option<Deployment>>,
    environment: std::sync::Mutex<HashMap<String, String>>,
}

impl KubernetesPod {
    pub async fn deployment(&self) -> Option<Deployment> {
        self.deployment.read().await.clone()
    }

    /// Applies an `env NAME=VALUE` command to the recorded environment.
    pub fn record_env_command(&self, cmd: &str) {
        let mut env = match self.environment.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        add_from_env_command(&mut env, cmd);
    }

    pub fn environment(&self) -> HashMap<String, String> {
        match self.environment.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn runtime_info(&self) -> String {
        let deployment = self.deployment().await;
        let pod_name = deployment
            .as_ref()
            .map(|d| d.pod_name.as_str())
            .unwrap_or("unknown");
        let opts = &self.base.options;
        format!(
            "[{} {} {}] Name={} Image={} HelperImage={} Labels={:?} Containers={} ServiceNames={:?} MainRuntime={}",
            self.pods.namespace(),
            self.base.id,
            self.base.name,
            opts.name,
            opts.main_container.image,
            opts.helper_container.image,
            opts.pod_labels,
            deployment.as_ref().map(|d| d.containers).unwrap_or_default(),
            deployment.as_ref().map(|d| d.service_names.clone()).unwrap_or_default(),
            self.pods.runtime_info(pod_name).await
        )
    }

    /// Creates the pod and its services on first use and waits until it runs.
    async fn ensure_pod(&self, token: &CancellationToken) -> Result<Deployment, AntError> {
        let mut deployment = self.deployment.write().await;
        if let Some(existing) = deployment.as_ref() {
            return Ok(existing.clone());
        }
        let base = &self.base;
        let started = Utc::now();
        let adapter = self.pods.adapter();

        let mut attempt = 0;
        let (build, created) = loop {
            attempt += 1;
            let result = match build_pod(&base.config, &base.options, self.credentials.as_deref())
            {
                Ok(build) => adapter.create_pod(&build.pod).await.map(|pod| (build, pod)),
                Err(err) => Err(err),
            };
            match result {
                Ok(done) => break done,
                Err(err) if attempt < MAX_BUILD_POD_TRIES && err.is_retryable() => {
                    warn!(
                        "Retrying pod {} creation attempt={} error={}",
                        base.name, attempt, err
                    );
                    tokio::time::sleep(BUILD_POD_RETRY_DELAY * attempt).await;
                }
                Err(err) => {
                    base.set_state(State::Failed).await;
                    return Err(AntError::Kubernetes(format!(
                        "setting up failed for pod: {} ({})",
                        err, base.name
                    )));
                }
            }
        };

        let containers = created
            .spec
            .as_ref()
            .map(|spec| spec.containers.len())
            .unwrap_or_default();
        base.write_trace(&format!(
            "creating pod Image={} Containers={} Services={:?} Aliases={:?} Privileged={}/{} Cost={}",
            base.options.main_container.image,
            containers,
            build.service_names,
            build.alias_names,
            base.options.privileged,
            base.config.kubernetes.allow_privilege_escalation,
            build.cost
        ));

        let pod_name = created
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| base.name.clone());
        let status = match self
            .pods
            .await_running(token, base.trace.clone(), &pod_name)
            .await
        {
            Ok(status) => status,
            Err(err) => {
                base.set_state(State::Failed).await;
                base.write_trace_error(&format!(
                    "failed to create pod Image={} Error={} Elapsed={}",
                    base.options.main_container.image,
                    err,
                    base.elapsed(Some(Utc::now()))
                ));
                if let Err(delete_err) = self.pods.delete(&pod_name).await {
                    warn!("Failed to delete pod {} that never ran: {}", pod_name, delete_err);
                }
                return Err(AntError::Kubernetes(format!(
                    "waiting for pod running: {}, Timeout={}s, Elapsed={}s",
                    err,
                    base.config.poll_timeout(),
                    (Utc::now() - started).num_seconds()
                )));
            }
        };
        base.set_host(&status.host_ip, &status.pod_ip).await;

        let mut kube_services = Vec::new();
        for service in &build.services {
            match adapter.create_service(service).await {
                Ok(svc) => kube_services.push(svc.metadata.name.unwrap_or_default()),
                Err(err) => {
                    base.set_state(State::Failed).await;
                    base.write_trace_error(&format!(
                        "failed to create service for pod {}: {}",
                        pod_name, err
                    ));
                    let mut errors = vec![err];
                    if let Err(delete_err) = self.pods.delete(&pod_name).await {
                        errors.push(delete_err);
                    }
                    errors.extend(self.pods.dispose(token, &kube_services).await);
                    return Err(AntError::Kubernetes(format!(
                        "setting up services failed for pod {}: {}",
                        pod_name,
                        AntError::aggregate(errors)
                            .err()
                            .map(|e| e.to_string())
                            .unwrap_or_default()
                    )));
                }
            }
        }

        let ready = Deployment {
            pod_name,
            uid: created.metadata.uid.clone().unwrap_or_default(),
            containers,
            service_names: build.service_names,
            kube_services,
            cost: build.cost,
        };
        info!(
            "Kubernetes pod {} running host={} ip={} cost={}",
            ready.pod_name, status.host_ip, status.pod_ip, ready.cost
        );
        *deployment = Some(ready.clone());
        Ok(ready)
    }
}

/// Executor backed by one pod holding the main, helper and service containers.
/// The pod is created on the first command.
pub struct KubernetesExecutor {
    pod: Arc<KubernetesPod>,
    lock: Mutex<()>,
}

impl KubernetesExecutor {
    pub fn new(
        config: Arc<AntConfig>,
        trace: Arc<dyn JobTrace>,
        opts: ExecutorOptions,
        pods: PodClient,
        credentials: Option<String>,
    ) -> Result<Self, AntError> {
        let ant_id = config.id.clone();
        let environment = opts.environment.clone();
        let base = BaseExecutor::new(uuid::Uuid::new_v4().to_string(), config, trace, opts)?;
        base.write_trace(&format!("running with ant {}", ant_id));
        base.write_trace_info(&format!(
            "preparing kubernetes container '{}' with image '{}'",
            base.name, base.options.main_container.image
        ));
        Ok(Self {
            pod: Arc::new(KubernetesPod {
                base,
                pods,
                credentials,
                deployment: RwLock::new(None),
                environment: std::sync::Mutex::new(environment),
            }),
            lock: Mutex::new(()),
        })
    }

    /// Name of the pod once it was created.
    pub async fn pod_name(&self) -> Option<String> {
        self.pod.deployment().await.map(|d| d.pod_name)
    }

    /// Relative cost of the pod's resource requests.
    pub async fn applied_cost(&self) -> f64 {
        self.pod.deployment().await.map(|d| d.cost).unwrap_or_default()
    }

    pub fn environment(&self) -> HashMap<String, String> {
        self.pod.environment()
    }

    fn pods(&self) -> &PodClient {
        &self.pod.pods
    }

    async fn do_async_execute(
        &self,
        token: &CancellationToken,
        container: &str,
        cmd: &str,
        helper: bool,
    ) -> Result<Arc<dyn CommandRunner>, AntError> {
        let _guard = self.lock.lock().await;
        self.pod.base.begin_execute(cmd).await?;
        let deployment = self.pod.ensure_pod(token).await?;
        let runner = KubernetesCommandRunner::start(
            self.pod.clone(),
            &deployment.pod_name,
            container,
            cmd,
            helper,
        )
        .await;
        Ok(Arc::new(runner))
    }
}

#[async_trait::async_trait]
impl Executor for KubernetesExecutor {
    fn id(&self) -> &str {
        &self.pod.base.id
    }

    fn name(&self) -> &str {
        &self.pod.base.name
    }

    fn method(&self) -> TaskMethod {
        TaskMethod::Kubernetes
    }

    fn trace(&self) -> Arc<dyn JobTrace> {
        self.pod.base.trace.clone()
    }

    async fn state(&self) -> State {
        self.pod.base.state().await
    }

    async fn info(&self) -> ExecutorInfo {
        self.pod.base.info().await
    }

    async fn async_execute(
        &self,
        token: &CancellationToken,
        cmd: &str,
        _vars: &HashMap<String, String>,
    ) -> Result<Arc<dyn CommandRunner>, AntError> {
        let name = self.pod.base.name.clone();
        self.do_async_execute(token, &name, cmd, false).await
    }

    async fn async_helper_execute(
        &self,
        token: &CancellationToken,
        cmd: &str,
        _vars: &HashMap<String, String>,
    ) -> Result<Arc<dyn CommandRunner>, AntError> {
        if self.pod.base.options.helper_container.image.is_empty() {
            return Err(AntError::Validation(format!(
                "no helper container for {}",
                self.pod.base.name
            )));
        }
        let name = self.helper_name();
        self.do_async_execute(token, &name, cmd, true).await
    }

    /// Deletes the pod and its services. Waits for the pod to terminate when
    /// `await_shutdown_pod` is configured.
    async fn stop(&self, token: &CancellationToken) -> Result<(), AntError> {
        let _guard = self.lock.lock().await;
        let base = &self.pod.base;
        let deployment = self.pod.deployment().await;
        if base.begin_stop().await.is_err() {
            let uid = deployment.as_ref().map(|d| d.uid.as_str()).unwrap_or("");
            return Err(AntError::AlreadyStopped(format!(
                "container [{} {}] is already stopped",
                uid, base.name
            )));
        }
        let Some(deployment) = deployment else {
            return Err(AntError::Kubernetes("no pod is running".to_string()));
        };
        base.write_trace_info("stopping container");

        let grace = base.config.termination_grace_period();
        let deleted = self.pods().delete(&deployment.pod_name).await;
        let mut errors = self.pods().dispose(token, &deployment.kube_services).await;
        for err in &errors {
            base.write_trace(&format!("dispose failed {}", err));
        }

        let elapsed = base.elapsed(base.ended_at().await);
        match deleted {
            Ok(()) => {
                base.write_trace_info(&format!(
                    "stopped container: Errors={} Elapsed={} StopWait={:?}",
                    errors.len(),
                    elapsed,
                    grace
                ));
                if base.config.kubernetes.await_shutdown_pod {
                    base.write_trace("awaiting for container to stop");
                    if let Err(err) = self
                        .pods()
                        .await_terminating(token, base.trace.clone(), &deployment.pod_name)
                        .await
                    {
                        base.write_trace_error(&format!(
                            "failed waiting for container to stop, Error={}",
                            err
                        ));
                        errors.push(err);
                    }
                }
            }
            Err(err) => {
                base.write_trace_error(&format!(
                    "failed to stop container: Error={} Elapsed={} StopWait={:?}",
                    err, elapsed, grace
                ));
                errors.insert(0, err);
            }
        }
        AntError::aggregate(errors)
    }

    async fn runtime_info(&self, _token: &CancellationToken) -> String {
        self.pod.runtime_info().await
    }
}
