use ants_core::config::AntConfig;
use ants_core::error::AntError;
use ants_core::executor::{ExecutorInfo, ExecutorProvider};
use ants_core::options::{ContainerDefinition, ExecutorOptions};
use ants_core::state::State;
use ants_core::trace::{BufferedTrace, JobTrace};
use ants_core::types::TaskMethod;
use ants_docker::{DockerAdapter, DockerProvider, ExecHandle, ExecStatus, ExecStream};
use chrono::Utc;
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
    built: Vec<String>,
    stopped: Vec<String>,
    execs: HashMap<String, ExecStatus>,
    next_exit_code: i32,
    fail_main_build: bool,
    fail_stop: bool,
}

#[derive(Default)]
struct FakeDocker {
    state: Mutex<FakeState>,
}

impl FakeDocker {
    fn built(&self) -> Vec<String> {
        self.state.lock().unwrap().built.clone()
    }

    fn stopped(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped.clone()
    }
}

#[async_trait::async_trait]
impl DockerAdapter for FakeDocker {
    async fn pull(&self, _image: &str) -> Result<(), AntError> {
        Ok(())
    }

    async fn build(
        &self,
        _opts: &ExecutorOptions,
        name: &str,
        _image: &str,
        _entrypoint: &[String],
        helper: bool,
    ) -> Result<String, AntError> {
        let mut state = self.state.lock().unwrap();
        if !helper && state.fail_main_build {
            return Err(AntError::Docker(format!("failed to create container {}", name)));
        }
        state.built.push(name.to_string());
        Ok(format!("id-{}", name))
    }

    async fn execute(
        &self,
        _opts: &ExecutorOptions,
        container_id: &str,
        cmd: &str,
        _helper: bool,
    ) -> Result<ExecHandle, AntError> {
        let mut state = self.state.lock().unwrap();
        let id = format!("exec-{}", state.execs.len());
        let exit_code = state.next_exit_code;
        state.execs.insert(
            id.clone(),
            ExecStatus {
                running: false,
                exit_code,
            },
        );
        let stream = ExecStream::default();
        stream.append_stdout(format!("{} in {}\n", cmd, container_id).as_bytes());
        stream.finish();
        Ok(ExecHandle {
            id,
            host: "docker-host".into(),
            container_ip: "172.17.0.2".into(),
            stream,
        })
    }

    async fn is_execute_running(&self, exec_id: &str) -> Result<ExecStatus, AntError> {
        self.state
            .lock()
            .unwrap()
            .execs
            .get(exec_id)
            .copied()
            .ok_or_else(|| AntError::NotFound(exec_id.to_string()))
    }

    async fn stop(
        &self,
        id: &str,
        _opts: &ExecutorOptions,
        _timeout: Duration,
    ) -> Result<(), AntError> {
        let mut state = self.state.lock().unwrap();
        state.stopped.push(id.to_string());
        if state.fail_stop {
            return Err(AntError::Docker(format!("failed to remove docker container {}", id)));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ExecutorInfo>, AntError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .built
            .iter()
            .map(|name| ExecutorInfo {
                id: format!("id-{}", name),
                name: name.clone(),
                method: TaskMethod::Docker,
                state: State::Running,
                started_at: Utc::now(),
                ended_at: None,
                labels: HashMap::new(),
                annotations: HashMap::new(),
                host: String::new(),
                container_ip: String::new(),
            })
            .collect())
    }

    async fn runtime_info(&self, container: &str) -> String {
        format!("logs of {}", container)
    }
}

fn options(name: &str, helper: bool) -> ExecutorOptions {
    let mut opts = ExecutorOptions::new(name, TaskMethod::Docker);
    opts.main_container = ContainerDefinition::with_image("alpine");
    if helper {
        opts.helper_container = ContainerDefinition::with_image("ants-helper");
    }
    opts
}

fn setup() -> (DockerProvider, Arc<FakeDocker>) {
    init_tracing();
    let fake = Arc::new(FakeDocker::default());
    let provider = DockerProvider::with_adapter(Arc::new(AntConfig::default()), fake.clone());
    (provider, fake)
}

fn trace() -> Arc<dyn JobTrace> {
    Arc::new(BufferedTrace::default())
}

#[tokio::test]
async fn test_builds_helper_then_main() {
    let (provider, fake) = setup();
    let token = CancellationToken::new();
    let exec = provider
        .new_executor(&token, trace(), options("job-1", true))
        .await
        .unwrap();
    assert_eq!(fake.built(), vec!["job-1-helper", "job-1"]);
    assert_eq!(exec.id(), "id-job-1");
    assert_eq!(exec.method(), TaskMethod::Docker);
    assert_eq!(provider.list_executors().await.len(), 1);
}

#[tokio::test]
async fn test_requires_image() {
    let (provider, fake) = setup();
    let opts = ExecutorOptions::new("no-image", TaskMethod::Docker);
    let err = provider
        .new_executor(&CancellationToken::new(), trace(), opts)
        .await
        .err()
        .unwrap();
    assert_eq!(err.to_string(), "Validation error: image not specified");
    assert!(fake.built().is_empty());
}

#[tokio::test]
async fn test_failed_main_build_removes_helper() {
    let (provider, fake) = setup();
    fake.state.lock().unwrap().fail_main_build = true;
    let result = provider
        .new_executor(&CancellationToken::new(), trace(), options("job-2", true))
        .await;
    assert!(result.is_err());
    assert_eq!(fake.stopped(), vec!["id-job-2-helper"]);
    assert!(provider.list_executors().await.is_empty());
}

#[tokio::test]
async fn test_execute_success() {
    let (provider, _fake) = setup();
    let token = CancellationToken::new();
    let exec = provider
        .new_executor(&token, trace(), options("job-3", true))
        .await
        .unwrap();
    assert_eq!(exec.state().await, State::Creating);

    let runner = exec.async_execute(&token, "make test", &HashMap::new()).await.unwrap();
    assert_eq!(exec.state().await, State::Running);
    let out = runner.wait(&token).await.unwrap();
    assert_eq!(out.stdout, b"make test in id-job-3\n");
    assert_eq!(runner.exit_code(), 0);
    assert_eq!(exec.info().await.host, "docker-host");

    let helper = exec
        .async_helper_execute(&token, "upload", &HashMap::new())
        .await
        .unwrap();
    assert_eq!(helper.wait(&token).await.unwrap().stdout, b"upload in id-job-3-helper\n");
}

#[tokio::test]
async fn test_execute_failure_dumps_runtime_info_once() {
    let (provider, fake) = setup();
    fake.state.lock().unwrap().next_exit_code = 2;
    let token = CancellationToken::new();
    let exec = provider
        .new_executor(&token, trace(), options("job-4", false))
        .await
        .unwrap();

    for _ in 0..2 {
        let runner = exec.async_execute(&token, "false", &HashMap::new()).await.unwrap();
        let err = runner.wait(&token).await.unwrap_err();
        assert!(matches!(err, AntError::CommandFailed { exit_code: 2, .. }));
        assert_eq!(runner.exit_code(), 2);
    }

    let text = String::from_utf8(exec.trace().finish()).unwrap();
    assert_eq!(text.matches("<<DOCKER RUNTIME-INFO BEGIN>>").count(), 1);
    assert!(text.contains("logs of job-4"));
}

#[tokio::test]
async fn test_stop_removes_containers_and_rejects_commands() {
    let (provider, fake) = setup();
    let token = CancellationToken::new();
    let exec = provider
        .new_executor(&token, trace(), options("job-5", true))
        .await
        .unwrap();
    let id = exec.id().to_string();

    provider.stop_executor(&token, &id, &options("job-5", true)).await.unwrap();
    assert_eq!(fake.stopped(), vec!["id-job-5", "id-job-5-helper"]);
    assert_eq!(exec.state().await, State::Removing);

    let err = exec
        .async_execute(&token, "ls", &HashMap::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AntError::AlreadyStopped(_)));
    let err = exec.stop(&token).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "container [id-job-5 job-5] is already stopped"
    );
}

#[tokio::test]
async fn test_stop_aggregates_errors() {
    let (provider, fake) = setup();
    let token = CancellationToken::new();
    let exec = provider
        .new_executor(&token, trace(), options("job-6", true))
        .await
        .unwrap();
    fake.state.lock().unwrap().fail_stop = true;
    let err = exec.stop(&token).await.unwrap_err();
    assert!(matches!(err, AntError::Multiple(ref errors) if errors.len() == 2));
    assert_eq!(fake.stopped().len(), 2);
}

#[tokio::test]
async fn test_stop_unknown_container_goes_to_adapter() {
    let (provider, fake) = setup();
    provider
        .stop_executor(&CancellationToken::new(), "stray", &options("stray", false))
        .await
        .unwrap();
    assert_eq!(fake.stopped(), vec!["stray"]);
}

#[tokio::test]
async fn test_all_running_executors_come_from_daemon() {
    let (provider, _fake) = setup();
    let token = CancellationToken::new();
    provider
        .new_executor(&token, trace(), options("job-7", true))
        .await
        .unwrap();
    let running = provider.all_running_executors(&token).await.unwrap();
    assert_eq!(running.len(), 2);
    assert_eq!(provider.list_executors().await.len(), 1);
}
