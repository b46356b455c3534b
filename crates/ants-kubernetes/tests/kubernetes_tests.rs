use ants_core::config::AntConfig;
use ants_core::error::AntError;
use ants_core::executor::{CommandOutput, Executor, ExecutorProvider};
use ants_core::options::{ContainerDefinition, ExecutorOptions, Port, Service as TaskService};
use ants_core::state::State;
use ants_core::trace::{BufferedTrace, JobTrace};
use ants_core::types::TaskMethod;
use ants_kubernetes::{
    ExecOutcome, KubernetesAdapter, KubernetesExecutor, KubernetesProvider, PodClient, POD_LABEL,
};
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
    });
}

#[derive(Default)]
struct FakeState {
    pods: HashMap<String, Pod>,
    created_pods: Vec<String>,
    deleted_pods: Vec<String>,
    execs: Vec<(String, String, Vec<String>)>,
    services: Vec<String>,
    deleted_services: Vec<String>,
    secrets: Vec<String>,
    deleted_secrets: Vec<String>,
    phase: String,
    waiting_reason: Option<String>,
    exit_code: i32,
    retryable_failures: u32,
    max_services: Option<usize>,
}

struct FakeKube {
    state: Mutex<FakeState>,
}

impl FakeKube {
    fn new(phase: &str) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                phase: phase.to_string(),
                ..FakeState::default()
            }),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn status_json(state: &FakeState, name: &str) -> serde_json::Value {
        let mut status = serde_json::json!({
            "phase": state.phase,
            "hostIP": "10.0.0.5",
            "podIP": "172.16.0.9",
        });
        if let Some(reason) = &state.waiting_reason {
            status["containerStatuses"] = serde_json::json!([{
                "name": name,
                "image": "alpine",
                "imageID": "",
                "ready": false,
                "restartCount": 0,
                "state": {"waiting": {"reason": reason, "message": "manifest unknown"}}
            }]);
        }
        status
    }
}

#[async_trait::async_trait]
impl KubernetesAdapter for FakeKube {
    fn namespace(&self) -> &str {
        "default"
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, AntError> {
        let mut state = self.state.lock().unwrap();
        if state.retryable_failures > 0 {
            state.retryable_failures -= 1;
            return Err(AntError::Kubernetes(
                "exceeded quota, please try again".to_string(),
            ));
        }
        let name = pod.metadata.name.clone().unwrap_or_default();
        let mut created = pod.clone();
        created.metadata.uid = Some(format!("uid-{}", name));
        created.status = Some(serde_json::from_value(Self::status_json(&state, &name))?);
        state.created_pods.push(name.clone());
        state.pods.insert(name, created.clone());
        Ok(created)
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, AntError> {
        Ok(self.state.lock().unwrap().pods.get(name).cloned())
    }

    async fn delete_pod(&self, name: &str, _grace: Duration) -> Result<(), AntError> {
        let mut state = self.state.lock().unwrap();
        state.pods.remove(name);
        state.deleted_pods.push(name.to_string());
        Ok(())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, AntError> {
        Ok(self.state.lock().unwrap().pods.values().cloned().collect())
    }

    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutcome, AntError> {
        let mut state = self.state.lock().unwrap();
        let stdout = format!("{}\n", command.join(" ")).into_bytes();
        state
            .execs
            .push((pod.to_string(), container.to_string(), command));
        let exit_code = state.exit_code;
        Ok(ExecOutcome {
            output: CommandOutput {
                stdout,
                stderr: Vec::new(),
            },
            exit_code,
            message: if exit_code == 0 {
                String::new()
            } else {
                format!("command terminated with non-zero exit code {}", exit_code)
            },
        })
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, AntError> {
        let mut state = self.state.lock().unwrap();
        let name = format!("credential-secret-{}", state.secrets.len());
        state.secrets.push(name.clone());
        let mut created = secret.clone();
        created.metadata.name = Some(name);
        Ok(created)
    }

    async fn delete_secret(&self, name: &str) -> Result<(), AntError> {
        self.with(|s| s.deleted_secrets.push(name.to_string()));
        Ok(())
    }

    async fn create_service(&self, service: &Service) -> Result<Service, AntError> {
        let name = service.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        if state.max_services.is_some_and(|max| state.services.len() >= max) {
            return Err(AntError::Kubernetes(format!("service {} rejected", name)));
        }
        state.services.push(name);
        Ok(service.clone())
    }

    async fn delete_service(&self, name: &str) -> Result<(), AntError> {
        self.with(|s| s.deleted_services.push(name.to_string()));
        Ok(())
    }

    async fn events(&self, pod: &str) -> Result<Vec<String>, AntError> {
        Ok(vec![format!("type=Normal reason=Scheduled message=assigned {}", pod)])
    }

    async fn logs(&self, _pod: &str, _limit_bytes: i64) -> Result<String, AntError> {
        Ok(String::new())
    }
}

fn config() -> AntConfig {
    let mut config = AntConfig::default();
    config.poll_interval_secs = 1;
    config.poll_timeout_secs = 5;
    config
}

fn options(name: &str) -> ExecutorOptions {
    let mut opts = ExecutorOptions::new(name, TaskMethod::Kubernetes);
    opts.main_container = ContainerDefinition::with_image("alpine");
    opts
}

fn trace() -> Arc<BufferedTrace> {
    Arc::new(BufferedTrace::new(0, Vec::new(), None))
}

fn provider(config: AntConfig, fake: Arc<FakeKube>) -> KubernetesProvider {
    init_tracing();
    KubernetesProvider::with_adapter(Arc::new(config), fake)
}

#[tokio::test]
async fn test_execute_creates_pod_and_runs_command() {
    let fake = FakeKube::new("Running");
    let provider = provider(config(), fake.clone());
    let token = CancellationToken::new();

    let executor = provider
        .new_executor(&token, trace(), options("job-1"))
        .await
        .unwrap();
    assert_eq!(executor.method(), TaskMethod::Kubernetes);
    let runner = executor
        .async_execute(&token, "echo hello", &HashMap::new())
        .await
        .unwrap();
    let output = runner.wait(&token).await.unwrap();

    assert_eq!(output.stdout, b"/bin/sh -c echo hello\n".to_vec());
    assert_eq!(runner.exit_code(), 0);
    assert_eq!(executor.state().await, State::Running);
    let info = executor.info().await;
    assert_eq!(info.host, "10.0.0.5");
    assert_eq!(info.container_ip, "172.16.0.9");

    fake.with(|s| {
        assert_eq!(s.created_pods, vec!["job-1".to_string()]);
        assert_eq!(s.execs[0].0, "job-1");
        assert_eq!(s.execs[0].1, "job-1");
        let labels = s.pods["job-1"].metadata.labels.clone().unwrap();
        assert_eq!(labels.get(POD_LABEL).map(String::as_str), Some("job-1"));
    });
}

#[tokio::test]
async fn test_pod_is_created_once_for_many_commands() {
    let fake = FakeKube::new("Running");
    let provider = provider(config(), fake.clone());
    let token = CancellationToken::new();
    let executor = provider
        .new_executor(&token, trace(), options("job-2"))
        .await
        .unwrap();
    for cmd in ["ls", "pwd"] {
        let runner = executor
            .async_execute(&token, cmd, &HashMap::new())
            .await
            .unwrap();
        runner.wait(&token).await.unwrap();
    }
    fake.with(|s| {
        assert_eq!(s.created_pods.len(), 1);
        assert_eq!(s.execs.len(), 2);
    });
}

#[tokio::test]
async fn test_without_shell_splits_command() {
    let fake = FakeKube::new("Running");
    let provider = provider(config(), fake.clone());
    let token = CancellationToken::new();
    let mut opts = options("job-3");
    opts.execute_command_without_shell = true;
    let executor = provider.new_executor(&token, trace(), opts).await.unwrap();
    let runner = executor
        .async_execute(&token, "ls -la /tmp", &HashMap::new())
        .await
        .unwrap();
    runner.wait(&token).await.unwrap();
    fake.with(|s| {
        assert_eq!(
            s.execs[0].2,
            vec!["ls".to_string(), "-la".to_string(), "/tmp".to_string()]
        );
    });
}

#[tokio::test]
async fn test_non_zero_exit_code_dumps_runtime_info() {
    let fake = FakeKube::new("Running");
    fake.with(|s| s.exit_code = 2);
    let provider = provider(config(), fake.clone());
    let token = CancellationToken::new();
    let job_trace = trace();
    let executor = provider
        .new_executor(&token, job_trace.clone(), options("job-4"))
        .await
        .unwrap();
    let runner = executor
        .async_execute(&token, "ls /missing", &HashMap::new())
        .await
        .unwrap();

    let err = runner.wait(&token).await.unwrap_err();
    assert!(matches!(err, AntError::CommandFailed { exit_code: 2, .. }));
    assert_eq!(runner.exit_code(), 2);
    assert!(runner.exit_message().contains("exit-code=2"));

    let contents = String::from_utf8_lossy(&job_trace.finish()).to_string();
    assert_eq!(contents.matches("KUBERNETES RUNTIME-INFO BEGIN").count(), 1);
    assert!(contents.contains("pod=job-4 status=Running"));
}

#[tokio::test]
async fn test_completed_pod_fails_to_start() {
    let fake = FakeKube::new("Failed");
    let provider = provider(config(), fake.clone());
    let token = CancellationToken::new();
    let executor = provider
        .new_executor(&token, trace(), options("job-5"))
        .await
        .unwrap();
    let err = executor
        .async_execute(&token, "ls", &HashMap::new())
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("pod job-5 is already failed"));
    assert_eq!(executor.state().await, State::Failed);
}

#[tokio::test]
async fn test_image_pull_backoff_fails_fast() {
    let fake = FakeKube::new("Pending");
    fake.with(|s| s.waiting_reason = Some("ImagePullBackOff".to_string()));
    let provider = provider(config(), fake.clone());
    let token = CancellationToken::new();
    let executor = provider
        .new_executor(&token, trace(), options("job-6"))
        .await
        .unwrap();
    let err = executor
        .async_execute(&token, "ls", &HashMap::new())
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("image pull failed: manifest unknown"));
}

#[tokio::test]
async fn test_retryable_pod_creation_is_retried() {
    let fake = FakeKube::new("Running");
    fake.with(|s| s.retryable_failures = 2);
    let provider = provider(config(), fake.clone());
    let token = CancellationToken::new();
    let executor = provider
        .new_executor(&token, trace(), options("job-7"))
        .await
        .unwrap();
    let runner = executor
        .async_execute(&token, "ls", &HashMap::new())
        .await
        .unwrap();
    runner.wait(&token).await.unwrap();
    fake.with(|s| assert_eq!(s.created_pods, vec!["job-7".to_string()]));
}

#[tokio::test]
async fn test_stop_deletes_pod_and_services() {
    let fake = FakeKube::new("Running");
    let provider = provider(config(), fake.clone());
    let token = CancellationToken::new();
    let mut opts = options("job-8");
    opts.services.push(TaskService {
        name: "redis".to_string(),
        image: "redis:7".to_string(),
        ports: vec![Port {
            number: 6379,
            protocol: String::new(),
            name: String::new(),
        }],
        ..TaskService::default()
    });
    let executor = provider.new_executor(&token, trace(), opts).await.unwrap();
    let runner = executor
        .async_execute(&token, "ls", &HashMap::new())
        .await
        .unwrap();
    runner.wait(&token).await.unwrap();

    provider
        .stop_executor(&token, executor.id(), &options("job-8"))
        .await
        .unwrap();
    assert_eq!(executor.state().await, State::Removing);
    fake.with(|s| {
        assert_eq!(s.deleted_pods, vec!["job-8".to_string()]);
        assert_eq!(s.services.len(), 1);
        assert_eq!(s.deleted_services, s.services);
    });

    let err = executor.stop(&token).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "container [uid-job-8 job-8] is already stopped"
    );
    let err = executor
        .async_execute(&token, "ls", &HashMap::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AntError::AlreadyStopped(_)));
}

#[tokio::test]
async fn test_failed_service_removes_pod_and_created_services() {
    let fake = FakeKube::new("Running");
    fake.with(|s| s.max_services = Some(1));
    let provider = provider(config(), fake.clone());
    let token = CancellationToken::new();
    let mut opts = options("job-15");
    for (name, port) in [("redis", 6379), ("postgres", 5432)] {
        opts.services.push(TaskService {
            name: name.to_string(),
            image: format!("{}:latest", name),
            ports: vec![Port {
                number: port,
                protocol: String::new(),
                name: String::new(),
            }],
            ..TaskService::default()
        });
    }
    let executor = provider.new_executor(&token, trace(), opts).await.unwrap();
    let err = executor
        .async_execute(&token, "ls", &HashMap::new())
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("setting up services failed for pod job-15"));
    assert!(err.to_string().contains("rejected"));
    assert_eq!(executor.state().await, State::Failed);
    fake.with(|s| {
        assert_eq!(s.deleted_pods, vec!["job-15".to_string()]);
        assert_eq!(s.services.len(), 1);
        assert_eq!(s.deleted_services, s.services);
        assert!(s.pods.is_empty());
    });
}

#[tokio::test]
async fn test_stop_without_pod() {
    let fake = FakeKube::new("Running");
    let provider = provider(config(), fake.clone());
    let token = CancellationToken::new();
    let executor = provider
        .new_executor(&token, trace(), options("job-9"))
        .await
        .unwrap();
    let err = executor.stop(&token).await.unwrap_err();
    assert!(err.to_string().contains("no pod is running"));
    assert_eq!(executor.state().await, State::Removing);
}

#[tokio::test]
async fn test_helper_requires_helper_image() {
    let fake = FakeKube::new("Running");
    let provider = provider(config(), fake.clone());
    let token = CancellationToken::new();
    let executor = provider
        .new_executor(&token, trace(), options("job-10"))
        .await
        .unwrap();
    let err = executor
        .async_helper_execute(&token, "ls", &HashMap::new())
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("no helper container for job-10"));
}

#[tokio::test]
async fn test_helper_runs_in_helper_container() {
    let fake = FakeKube::new("Running");
    let provider = provider(config(), fake.clone());
    let token = CancellationToken::new();
    let mut opts = options("job-11");
    opts.helper_container = ContainerDefinition::with_image("ants-helper");
    let executor = provider.new_executor(&token, trace(), opts).await.unwrap();
    let runner = executor
        .async_helper_execute(&token, "ls", &HashMap::new())
        .await
        .unwrap();
    assert!(runner.is_helper());
    runner.wait(&token).await.unwrap();
    fake.with(|s| {
        assert_eq!(s.execs[0].1, "job-11-helper");
        let containers = &s.pods["job-11"].spec.as_ref().unwrap().containers;
        assert_eq!(containers.len(), 2);
    });
}

#[tokio::test]
async fn test_registry_credentials_created_once() {
    let fake = FakeKube::new("Running");
    let mut config = config();
    config.kubernetes.registry.server = "registry.example.com".to_string();
    config.kubernetes.registry.username = "ant".to_string();
    config.kubernetes.registry.password = "secret".to_string();
    let provider = provider(config, fake.clone());
    let token = CancellationToken::new();

    for name in ["job-12", "job-13"] {
        let executor = provider
            .new_executor(&token, trace(), options(name))
            .await
            .unwrap();
        let runner = executor
            .async_execute(&token, "ls", &HashMap::new())
            .await
            .unwrap();
        runner.wait(&token).await.unwrap();
    }
    fake.with(|s| {
        assert_eq!(s.secrets, vec!["credential-secret-0".to_string()]);
        let secrets = s.pods["job-13"]
            .spec
            .as_ref()
            .unwrap()
            .image_pull_secrets
            .clone()
            .unwrap();
        assert_eq!(
            serde_json::to_value(&secrets[0]).unwrap()["name"],
            "credential-secret-0"
        );
    });

    provider.dispose().await.unwrap();
    fake.with(|s| assert_eq!(s.deleted_secrets, vec!["credential-secret-0".to_string()]));
}

#[tokio::test]
async fn test_all_running_executors_lists_pods() {
    let fake = FakeKube::new("Running");
    let provider = provider(config(), fake.clone());
    let token = CancellationToken::new();
    let executor = provider
        .new_executor(&token, trace(), options("job-14"))
        .await
        .unwrap();
    let runner = executor
        .async_execute(&token, "ls", &HashMap::new())
        .await
        .unwrap();
    runner.wait(&token).await.unwrap();

    let infos = provider.all_running_executors(&token).await.unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].id, "uid-job-14");
    assert_eq!(infos[0].name, "job-14");
    assert_eq!(infos[0].state, State::Running);
    assert_eq!(infos[0].method, TaskMethod::Kubernetes);
    assert_eq!(provider.list_executors().await.len(), 1);
}

#[tokio::test]
async fn test_unknown_stop_deletes_pod_by_name() {
    let fake = FakeKube::new("Running");
    let provider = provider(config(), fake.clone());
    let token = CancellationToken::new();
    provider
        .stop_executor(&token, "ants-orphan", &options("ants-orphan"))
        .await
        .unwrap();
    fake.with(|s| assert_eq!(s.deleted_pods, vec!["ants-orphan".to_string()]));
}

#[tokio::test]
async fn test_env_command_updates_environment() {
    let fake = FakeKube::new("Running");
    let config = Arc::new(config());
    let pods = PodClient::new(fake.clone(), config.clone());
    let executor =
        KubernetesExecutor::new(config, trace(), options("job-15"), pods, None).unwrap();
    let token = CancellationToken::new();
    let runner = executor
        .async_execute(&token, "env STAGE=build", &HashMap::new())
        .await
        .unwrap();
    runner.wait(&token).await.unwrap();
    assert_eq!(
        executor.environment().get("STAGE").map(String::as_str),
        Some("build")
    );
    assert_eq!(executor.pod_name().await.as_deref(), Some("job-15"));
}

#[tokio::test]
async fn test_await_terminating_returns_once_pod_is_gone() {
    let fake = FakeKube::new("Running");
    let mut config = config();
    config.kubernetes.await_shutdown_pod = true;
    let provider = provider(config, fake.clone());
    let token = CancellationToken::new();
    let executor = provider
        .new_executor(&token, trace(), options("job-16"))
        .await
        .unwrap();
    let runner = executor
        .async_execute(&token, "ls", &HashMap::new())
        .await
        .unwrap();
    runner.wait(&token).await.unwrap();
    executor.stop(&token).await.unwrap();
    fake.with(|s| assert!(s.pods.is_empty()));
}
