//! Pod queries and waits built on the adapter: phase checks, the running and
//! terminating polls, command execution and teardown of per-task services.

use crate::adapter::{ExecOutcome, KubernetesAdapter};
use ants_core::config::AntConfig;
use ants_core::error::AntError;
use ants_core::executor::ExecutorInfo;
use ants_core::future::{await_all, execute, execute_polling};
use ants_core::state::State;
use ants_core::trace::{JobTrace, TraceTag};
use ants_core::types::TaskMethod;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const POD_RUNNING: &str = "Running";
pub const POD_SUCCEEDED: &str = "Succeeded";
pub const POD_FAILED: &str = "Failed";

const DIAGNOSTICS_EVERY: u32 = 60;
const MAX_LOG_BYTES: i64 = 1024 * 1024;

/// Snapshot of the fields read from a pod status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodPhase {
    pub phase: String,
    pub host_ip: String,
    pub pod_ip: String,
    /// `(reason, message)` of containers that are waiting and not ready.
    pub waiting: Vec<(String, String)>,
    pub conditions: Vec<String>,
}

impl PodPhase {
    pub fn of(pod: &Pod) -> Self {
        let Some(status) = &pod.status else {
            return PodPhase::default();
        };
        let waiting = status
            .container_statuses
            .iter()
            .flatten()
            .filter(|c| !c.ready)
            .filter_map(|c| c.state.as_ref()?.waiting.as_ref())
            .map(|w| {
                (
                    w.reason.clone().unwrap_or_default(),
                    w.message.clone().unwrap_or_default(),
                )
            })
            .collect();
        let conditions = status
            .conditions
            .iter()
            .flatten()
            .map(|c| {
                format!(
                    "type={} status={} reason={} message={}",
                    c.type_,
                    c.status,
                    c.reason.as_deref().unwrap_or(""),
                    c.message.as_deref().unwrap_or("")
                )
            })
            .collect();
        PodPhase {
            phase: status.phase.clone().unwrap_or_default(),
            host_ip: status.host_ip.clone().unwrap_or_default(),
            pod_ip: status.pod_ip.clone().unwrap_or_default(),
            waiting,
            conditions,
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase == POD_RUNNING
    }

    /// Waiting reason and message of the first container whose image cannot be pulled.
    pub fn image_pull_failure(&self) -> Option<&str> {
        self.waiting
            .iter()
            .find(|(reason, _)| reason == "ErrImagePull" || reason == "ImagePullBackOff")
            .map(|(_, message)| message.as_str())
    }
}

/// Executor state reported for a pod phase.
pub fn state_of_phase(phase: &str) -> State {
    match phase {
        "Pending" => State::Pending,
        POD_RUNNING => State::Running,
        POD_SUCCEEDED => State::Succeeded,
        POD_FAILED => State::Failed,
        _ => State::Unknown,
    }
}

/// Result of a command executed in a running pod.
#[derive(Debug, Clone, Default)]
pub struct PodExec {
    pub outcome: ExecOutcome,
    pub host_ip: String,
    pub pod_ip: String,
}

/// Error returned for a command that ended with a non-zero exit code. The
/// message ends in the exit code.
pub fn stream_error(cmd: &str, pod: &str, message: &str) -> AntError {
    AntError::Kubernetes(format!(
        "failed to execute with stream {} in pod {} due to: {}",
        cmd, pod, message
    ))
}

fn trace_line(trace: &dyn JobTrace, name: &str, msg: &str) {
    trace.writeln(
        &format!(
            "[{} KUBERNETES {}] {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            name,
            msg
        ),
        TraceTag::Exec,
    );
}

/// Pod operations over one adapter and namespace.
#[derive(Clone)]
pub struct PodClient {
    adapter: Arc<dyn KubernetesAdapter>,
    config: Arc<AntConfig>,
}

impl PodClient {
    pub fn new(adapter: Arc<dyn KubernetesAdapter>, config: Arc<AntConfig>) -> Self {
        Self { adapter, config }
    }

    pub fn adapter(&self) -> &Arc<dyn KubernetesAdapter> {
        &self.adapter
    }

    pub fn namespace(&self) -> &str {
        self.adapter.namespace()
    }

    pub async fn phase(&self, name: &str) -> Result<PodPhase, AntError> {
        if name.is_empty() {
            return Err(AntError::Validation(
                "container name cannot be empty when checking pod phase".to_string(),
            ));
        }
        match self.adapter.get_pod(name).await {
            Ok(Some(pod)) => Ok(PodPhase::of(&pod)),
            Ok(None) => Err(AntError::NotFound(format!(
                "failed to get pod-phase for '{}' due to pod not found",
                name
            ))),
            Err(err) => Err(AntError::Kubernetes(format!(
                "failed to get pod-phase for '{}' due to {}",
                name, err
            ))),
        }
    }

    /// Polls the pod phase until it is running. A pod that already completed
    /// or whose image cannot be pulled fails immediately. Gives up after the
    /// configured poll timeout.
    pub async fn await_running(
        &self,
        token: &CancellationToken,
        trace: Arc<dyn JobTrace>,
        name: &str,
    ) -> Result<PodPhase, AntError> {
        if name.is_empty() {
            return Err(AntError::Validation(
                "container name cannot be empty when awaiting for running".to_string(),
            ));
        }
        let started = Utc::now();
        let timeout = Duration::from_secs(self.config.poll_timeout() as u64);
        let deadline = deadline_token(token, timeout);

        let client = self.clone();
        let pod_name = name.to_string();
        let probe_trace = trace.clone();
        let mut tried: u32 = 0;
        let mut awaiter = execute_polling(
            &deadline,
            move |_stop| {
                let attempt = tried;
                tried += 1;
                let client = client.clone();
                let name = pod_name.clone();
                let trace = probe_trace.clone();
                async move { client.probe_running(trace.as_ref(), &name, attempt).await }
            },
            None,
            self.config.poll_interval(),
        );
        let result = awaiter.wait(&deadline).await;
        deadline.cancel();
        if let Err(err) = &result {
            trace_line(
                trace.as_ref(),
                name,
                &format!(
                    "waiting for running failed Timeout={:?} Elapsed={}s Error={}",
                    timeout,
                    (Utc::now() - started).num_seconds(),
                    err
                ),
            );
        }
        result
    }

    async fn probe_running(
        &self,
        trace: &dyn JobTrace,
        name: &str,
        attempt: u32,
    ) -> Result<Option<PodPhase>, AntError> {
        let status = self.phase(name).await?;
        match status.phase.as_str() {
            POD_RUNNING => {
                trace_line(
                    trace,
                    name,
                    &format!("pod-running ready with Status={}", status.phase),
                );
                return Ok(Some(status));
            }
            POD_SUCCEEDED => {
                return Err(AntError::Kubernetes(format!(
                    "failed to wait for running state, pod {} is already succeeded",
                    name
                )))
            }
            POD_FAILED => {
                return Err(AntError::Kubernetes(format!(
                    "failed to wait for running state, pod {} is already failed",
                    name
                )))
            }
            _ => {}
        }
        if let Some(message) = status.image_pull_failure() {
            let err = AntError::Kubernetes(format!("image pull failed: {}", message));
            trace_line(
                trace,
                name,
                &format!(
                    "waiting for pod-running failed with Status={} Error={}",
                    status.phase, err
                ),
            );
            return Err(err);
        }

        trace_line(
            trace,
            name,
            &format!(
                "waiting for running state but status is still {}",
                status.phase
            ),
        );
        if attempt % DIAGNOSTICS_EVERY == 0 {
            for condition in &status.conditions {
                trace_line(
                    trace,
                    name,
                    &format!("pod-state {} {}", status.phase, condition),
                );
            }
            if let Ok(events) = self.adapter.events(name).await {
                for event in events {
                    trace_line(trace, name, &event);
                }
            }
        }
        info!(
            "Waiting for pod {} to run phase={} namespace={}",
            name,
            status.phase,
            self.namespace()
        );
        Ok(None)
    }

    /// Polls until the pod is gone or no longer running.
    pub async fn await_terminating(
        &self,
        token: &CancellationToken,
        trace: Arc<dyn JobTrace>,
        name: &str,
    ) -> Result<(), AntError> {
        if name.is_empty() {
            return Err(AntError::Validation(
                "container name cannot be empty when awaiting for termination".to_string(),
            ));
        }
        let deadline = deadline_token(token, self.config.termination_grace_period());
        let adapter = self.adapter.clone();
        let pod_name = name.to_string();
        let mut awaiter = execute_polling(
            &deadline,
            move |_stop| {
                let adapter = adapter.clone();
                let name = pod_name.clone();
                let trace = trace.clone();
                async move {
                    let Some(pod) = adapter.get_pod(&name).await? else {
                        return Ok(Some(()));
                    };
                    let status = PodPhase::of(&pod);
                    if !status.is_running() {
                        return Ok(Some(()));
                    }
                    trace_line(
                        trace.as_ref(),
                        &name,
                        &format!(
                            "waiting for terminating but status is still {}",
                            status.phase
                        ),
                    );
                    Ok(None)
                }
            },
            None,
            self.config.poll_interval(),
        );
        let result = awaiter.wait(&deadline).await;
        deadline.cancel();
        result
    }

    /// Runs `cmd` in `container`, or in the first container of the pod when
    /// `container` is empty. The pod must be running.
    pub async fn execute(
        &self,
        pod_name: &str,
        container: &str,
        cmd: &str,
        without_shell: bool,
    ) -> Result<PodExec, AntError> {
        let pod = self
            .adapter
            .get_pod(pod_name)
            .await
            .map_err(|err| {
                AntError::Kubernetes(format!("couldn't get pod details due to {}", err))
            })?
            .ok_or_else(|| {
                AntError::NotFound(format!("couldn't get pod details for {}", pod_name))
            })?;
        let status = PodPhase::of(&pod);
        if !status.is_running() {
            return Err(AntError::Kubernetes(format!(
                "pod {:?} (on namespace {:?}) is not running and cannot execute commands; current phase is {:?}",
                pod_name,
                self.namespace(),
                status.phase
            )));
        }

        let container = if container.is_empty() {
            pod.spec
                .as_ref()
                .and_then(|spec| spec.containers.first())
                .map(|c| c.name.clone())
                .unwrap_or_default()
        } else {
            container.to_string()
        };
        let command: Vec<String> = if without_shell {
            cmd.split(' ').map(str::to_string).collect()
        } else {
            vec!["/bin/sh".to_string(), "-c".to_string(), cmd.to_string()]
        };
        debug!(
            "Executing in pod {} container={} command={}",
            pod_name, container, cmd
        );
        let outcome = self.adapter.exec(pod_name, &container, command).await?;
        Ok(PodExec {
            outcome,
            host_ip: status.host_ip,
            pod_ip: status.pod_ip,
        })
    }

    pub async fn delete(&self, name: &str) -> Result<(), AntError> {
        self.adapter
            .delete_pod(name, self.config.termination_grace_period())
            .await
    }

    /// Deletes per-task services concurrently and returns every failure.
    pub async fn dispose(&self, token: &CancellationToken, services: &[String]) -> Vec<AntError> {
        let awaiters = services
            .iter()
            .map(|name| {
                let adapter = self.adapter.clone();
                let name = name.clone();
                execute(
                    token,
                    move |_stop| async move { adapter.delete_service(&name).await },
                    None,
                )
            })
            .collect();
        await_all(token, awaiters)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect()
    }

    /// Status, conditions, events and the pod object, plus logs in debug mode.
    pub async fn runtime_info(&self, name: &str) -> String {
        let mut pod = match self.adapter.get_pod(name).await {
            Ok(Some(pod)) => pod,
            Ok(None) => return format!("pod={} error=not found", name),
            Err(err) => return format!("pod={} error={}", name, err),
        };
        let status = PodPhase::of(&pod);
        let mut out = format!("pod={} status={}\n", name, status.phase);
        for condition in &status.conditions {
            out.push_str(&format!("pod condition {}\n", condition));
        }
        match self.adapter.events(name).await {
            Ok(events) => {
                for event in events {
                    out.push_str(&format!("pod event {}\n", event));
                }
            }
            Err(err) => out.push_str(&format!("pod events error={}\n", err)),
        }
        if self.config.debug {
            if let Ok(logs) = self.adapter.logs(name, MAX_LOG_BYTES).await {
                out.push_str(&logs);
            }
        }
        pod.metadata.managed_fields = None;
        if let Ok(json) = serde_json::to_string(&pod) {
            out.push_str(&json);
        }
        out
    }

    pub async fn list(&self) -> Result<Vec<ExecutorInfo>, AntError> {
        let pods = self.adapter.list_pods().await?;
        Ok(pods
            .iter()
            .map(|pod| {
                let status = PodPhase::of(pod);
                let meta = &pod.metadata;
                ExecutorInfo {
                    id: meta.uid.clone().unwrap_or_default(),
                    name: meta.name.clone().unwrap_or_default(),
                    method: TaskMethod::Kubernetes,
                    state: state_of_phase(&status.phase),
                    started_at: meta
                        .creation_timestamp
                        .as_ref()
                        .map(|t| t.0)
                        .unwrap_or_else(Utc::now),
                    ended_at: None,
                    labels: meta.labels.clone().unwrap_or_default().into_iter().collect(),
                    annotations: meta
                        .annotations
                        .clone()
                        .unwrap_or_default()
                        .into_iter()
                        .collect(),
                    host: status.host_ip,
                    container_ip: status.pod_ip,
                }
            })
            .collect())
    }
}

/// Child of `token` that is cancelled once `timeout` elapses.
fn deadline_token(token: &CancellationToken, timeout: Duration) -> CancellationToken {
    let deadline = token.child_token();
    let timer = deadline.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = timer.cancelled() => {}
            _ = tokio::time::sleep(timeout) => timer.cancel(),
        }
    });
    deadline
}
