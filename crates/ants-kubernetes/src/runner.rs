use crate::executor::KubernetesPod;
use crate::pods::{stream_error, PodExec};
use ants_core::base::RunnerBase;
use ants_core::error::AntError;
use ants_core::executor::{CommandOutput, CommandRunner};
use ants_core::future::{execute_watchdog, Awaiter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One command in a pod container. The exec stream runs under a watchdog
/// that fails the command as soon as the pod leaves the running phase.
pub struct KubernetesCommandRunner {
    base: RunnerBase,
    pod: Arc<KubernetesPod>,
    pod_name: String,
    container: String,
    awaiter: Mutex<Option<Awaiter<PodExec>>>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl KubernetesCommandRunner {
    pub(crate) async fn start(
        pod: Arc<KubernetesPod>,
        pod_name: &str,
        container: &str,
        cmd: &str,
        helper: bool,
    ) -> Self {
        let base = RunnerBase::new(&pod.base, cmd, helper, &pod.base.host().await);
        base.write_trace(&format!("$ {}", cmd));

        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));

        let handler = {
            let pod = pod.clone();
            let running = running.clone();
            let pod_name = pod_name.to_string();
            let container = container.to_string();
            let cmd = cmd.to_string();
            move |stop: CancellationToken| async move {
                let without_shell = pod.base.options.execute_command_without_shell;
                let result = tokio::select! {
                    _ = stop.cancelled() => Err(AntError::DeadlineExceeded),
                    res = pod.pods.execute(&pod_name, &container, &cmd, without_shell) => res,
                };
                if let Ok(exec) = &result {
                    pod.base.set_host(&exec.host_ip, &exec.pod_ip).await;
                }
                running.store(false, Ordering::SeqCst);
                result
            }
        };
        let watchdog = {
            let pods = pod.pods.clone();
            let pod_name = pod_name.to_string();
            let container = container.to_string();
            let cmd = cmd.to_string();
            move |_stop: CancellationToken| {
                let pods = pods.clone();
                let pod_name = pod_name.clone();
                let container = container.clone();
                let cmd = cmd.clone();
                async move {
                    let status = pods.phase(&pod_name).await.map_err(|err| {
                        AntError::Kubernetes(format!(
                            "failed to check pod phase before executing command '{}' for pod '{}' ['{}'] due to '{}'",
                            cmd, pod_name, container, err
                        ))
                    })?;
                    if !status.is_running() {
                        return Err(AntError::Kubernetes(format!(
                            "Pod={:?} Status={:?}",
                            pod_name, status.phase
                        )));
                    }
                    Ok(())
                }
            }
        };
        let awaiter = execute_watchdog(
            &cancel,
            handler,
            watchdog,
            None,
            pod.base.config.poll_interval(),
        );
        debug!("Started command in pod {} container={} command={}", pod_name, container, cmd);

        Self {
            base,
            pod,
            pod_name: pod_name.to_string(),
            container: container.to_string(),
            awaiter: Mutex::new(Some(awaiter)),
            running,
            cancel,
        }
    }

    pub fn pod_name(&self) -> &str {
        &self.pod_name
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    async fn dump_runtime_info(&self) {
        if !self.base.helper && self.pod.base.claim_runtime_dump().await {
            self.base.write_dump(
                "*********************** <<KUBERNETES RUNTIME-INFO BEGIN>> **************************",
            );
            self.base.write_dump(&self.pod.runtime_info().await);
            self.base.write_dump(
                "*********************** <<KUBERNETES RUNTIME-INFO END>>  **************************",
            );
        }
    }
}

#[async_trait::async_trait]
impl CommandRunner for KubernetesCommandRunner {
    fn id(&self) -> &str {
        &self.base.id
    }

    fn command(&self) -> &str {
        &self.base.command
    }

    fn is_helper(&self) -> bool {
        self.base.helper
    }

    async fn wait(&self, token: &CancellationToken) -> Result<CommandOutput, AntError> {
        let mut awaiter = self.awaiter.lock().await.take().ok_or_else(|| {
            AntError::Internal(format!("command '{}' is not running", self.base.command))
        })?;
        let (output, outcome) = match awaiter.wait(token).await {
            Ok(exec) if exec.outcome.exit_code == 0 => {
                self.pod.record_env_command(&self.base.command);
                (exec.outcome.output, Ok(()))
            }
            Ok(exec) => {
                warn!(
                    "{}",
                    stream_error(&self.base.command, &self.pod_name, &exec.outcome.message)
                );
                (
                    exec.outcome.output,
                    Err(AntError::CommandFailed {
                        command: self.base.command.clone(),
                        exit_code: exec.outcome.exit_code,
                    }),
                )
            }
            Err(err) => (CommandOutput::default(), Err(err)),
        };
        let failed = outcome.is_err();
        let result = self.base.finish(output, outcome);
        if failed {
            self.dump_runtime_info().await;
        }
        result
    }

    async fn is_running(&self, _token: &CancellationToken) -> Result<bool, AntError> {
        Ok(self.running.load(Ordering::SeqCst))
    }

    async fn stop(&self, _token: &CancellationToken, _timeout: Duration) -> Result<(), AntError> {
        self.cancel.cancel();
        Ok(())
    }

    fn stdout(&self) -> Vec<u8> {
        self.base.stdout()
    }

    fn stderr(&self) -> Vec<u8> {
        self.base.stderr()
    }

    fn exit_code(&self) -> i32 {
        self.base.exit_code()
    }

    fn exit_message(&self) -> String {
        self.base.exit_message()
    }
}
