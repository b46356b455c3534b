use ants_core::error::AntError;
use ants_core::executor::{CommandOutput, ExecutorInfo};
use ants_core::options::{ContainerDefinition, ExecutorOptions};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Output of one exec session, filled in by a background copy task.
#[derive(Clone, Default)]
pub struct ExecStream {
    output: Arc<Mutex<CommandOutput>>,
    finished: Arc<AtomicBool>,
}

impl ExecStream {
    fn lock(&self) -> std::sync::MutexGuard<'_, CommandOutput> {
        match self.output.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn append_stdout(&self, data: &[u8]) {
        self.lock().stdout.extend_from_slice(data);
    }

    pub fn append_stderr(&self, data: &[u8]) {
        self.lock().stderr.extend_from_slice(data);
    }

    /// Marks the stream as fully copied.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> CommandOutput {
        self.lock().clone()
    }
}

/// A started exec session.
pub struct ExecHandle {
    pub id: String,
    pub host: String,
    pub container_ip: String,
    pub stream: ExecStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStatus {
    pub running: bool,
    pub exit_code: i32,
}

/// Docker operations the executor needs.
#[async_trait::async_trait]
pub trait DockerAdapter: Send + Sync {
    /// Fetches `image`, with registry credentials when it names the configured server.
    async fn pull(&self, image: &str) -> Result<(), AntError>;

    /// Creates and starts a container. On failure the container, and the
    /// named volumes when this build [owns](owns_volumes) them, are removed
    /// again. Returns the container id.
    async fn build(
        &self,
        opts: &ExecutorOptions,
        name: &str,
        image: &str,
        entrypoint: &[String],
        helper: bool,
    ) -> Result<String, AntError>;

    /// Creates and starts an exec session in `container_id`.
    async fn execute(
        &self,
        opts: &ExecutorOptions,
        container_id: &str,
        cmd: &str,
        helper: bool,
    ) -> Result<ExecHandle, AntError>;

    async fn is_execute_running(&self, exec_id: &str) -> Result<ExecStatus, AntError>;

    /// Stops and force-removes the container, then its named volumes.
    async fn stop(
        &self,
        id: &str,
        opts: &ExecutorOptions,
        timeout: Duration,
    ) -> Result<(), AntError>;

    async fn list(&self) -> Result<Vec<ExecutorInfo>, AntError>;

    async fn runtime_info(&self, container: &str) -> String;
}

/// Command vector for an exec session.
pub fn exec_command(cmd: &str, without_shell: bool) -> Vec<String> {
    if without_shell {
        cmd.split(' ').map(str::to_string).collect()
    } else {
        vec!["/bin/sh".to_string(), "-c".to_string(), cmd.to_string()]
    }
}

/// A mount derived from a container definition's docker volumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub bind: bool,
    pub source: String,
    pub target: String,
}

/// Keys containing `bind-mount` map a container path to a host path;
/// every other key names a docker volume mounted at the value.
pub fn volume_mounts(container: &ContainerDefinition) -> Vec<VolumeMount> {
    let mut mounts: Vec<VolumeMount> = container
        .volumes
        .iter()
        .map(|(k, v)| {
            if k.contains("bind-mount") {
                VolumeMount {
                    bind: true,
                    source: v.clone(),
                    target: k.clone(),
                }
            } else {
                VolumeMount {
                    bind: false,
                    source: k.clone(),
                    target: v.clone(),
                }
            }
        })
        .collect();
    mounts.sort_by(|a, b| a.target.cmp(&b.target));
    mounts
}

/// Named volumes the adapter creates before and removes after a run.
pub fn volume_names(container: &ContainerDefinition) -> Vec<String> {
    let mut names: Vec<String> = container
        .volumes
        .keys()
        .filter(|k| !k.contains("bind-mount"))
        .cloned()
        .collect();
    names.sort();
    names
}

/// `volumes_from` only applies when every volume has a source container.
pub fn has_volumes_from(container: &ContainerDefinition) -> bool {
    !container.volumes.is_empty()
        && !container.volumes_from.is_empty()
        && container.volumes.len() == container.volumes_from.len()
}

/// The build that creates a task's named volumes also removes them when it
/// fails: the helper when there is one, otherwise the main container.
pub fn owns_volumes(opts: &ExecutorOptions, helper: bool) -> bool {
    opts.main_container.has_docker_volumes() && (helper || opts.helper_container.image.is_empty())
}

/// Runs `cleanup` when `result` failed. The original error is returned; a
/// failed cleanup is only logged.
pub(crate) async fn or_unwind<T, F, Fut>(result: Result<T, AntError>, cleanup: F) -> Result<T, AntError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), AntError>>,
{
    if result.is_err() {
        if let Err(err) = cleanup().await {
            warn!("Failed to clean up after failed build: {}", err);
        }
    }
    result
}

pub(crate) fn env_for(opts: &ExecutorOptions, helper: bool) -> Vec<String> {
    let env: &HashMap<String, String> = if helper {
        &opts.helper_environment
    } else {
        &opts.environment
    };
    ExecutorOptions::environment_pairs(env)
}
