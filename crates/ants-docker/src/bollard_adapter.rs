use crate::adapter::{
    env_for, exec_command, has_volumes_from, or_unwind, owns_volumes, volume_mounts,
    volume_names, DockerAdapter, ExecHandle, ExecStatus, ExecStream,
};
use ants_core::config::DockerConfig;
use ants_core::error::AntError;
use ants_core::executor::ExecutorInfo;
use ants_core::options::{ContainerDefinition, ExecutorOptions};
use ants_core::state::State;
use ants_core::types::{PullPolicy, TaskMethod};
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum, RestartPolicy, RestartPolicyNameEnum};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{TimeZone, Utc};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT_SECS: u64 = 120;
const VOLUME_REMOVE_ATTEMPTS: usize = 10;
const LOG_TAIL_LINES: &str = "100";

fn docker_error(context: String, err: bollard::errors::Error) -> AntError {
    AntError::Docker(format!("{} due to {}", context, err))
}

/// Images without a tag or digest would pull every tag.
fn image_reference(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains(':') || last.contains('@') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

/// [`DockerAdapter`] backed by the Docker Engine API.
pub struct BollardAdapter {
    docker: Docker,
    config: DockerConfig,
}

impl BollardAdapter {
    pub fn connect(config: DockerConfig) -> Result<Self, AntError> {
        let docker = if config.host.is_empty() {
            Docker::connect_with_local_defaults()
        } else if config.host.starts_with("unix://") {
            Docker::connect_with_socket(&config.host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_http(&config.host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        }
        .map_err(|e| docker_error(format!("failed to connect to docker at '{}'", config.host), e))?;
        info!("Docker client connected host={}", config.host);
        Ok(Self { docker, config })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), AntError> {
        match self.config.registry.pull_policy {
            PullPolicy::Always => self.pull(image).await,
            PullPolicy::IfNotPresent => {
                if self.docker.inspect_image(image).await.is_ok() {
                    Ok(())
                } else {
                    self.pull(image).await
                }
            }
            PullPolicy::Never => Ok(()),
        }
    }

    async fn create_volumes(&self, container: &ContainerDefinition) -> Result<(), AntError> {
        for name in volume_names(container) {
            let options = CreateVolumeOptions {
                name: name.clone(),
                labels: HashMap::from([("type".to_string(), "shared".to_string())]),
                ..Default::default()
            };
            self.docker
                .create_volume(options)
                .await
                .map_err(|e| docker_error(format!("failed to create docker volume {}", name), e))?;
        }
        Ok(())
    }

    async fn remove_volumes(&self, container: &ContainerDefinition) -> Result<(), AntError> {
        for name in volume_names(container) {
            let mut attempt = 0;
            loop {
                attempt += 1;
                let removed = self
                    .docker
                    .remove_volume(&name, Some(RemoveVolumeOptions { force: true }))
                    .await
                    .map_err(|e| docker_error(format!("failed to remove docker volume {}", name), e));
                match removed {
                    Ok(()) => break,
                    Err(err) if err.is_retryable() && attempt < VOLUME_REMOVE_ATTEMPTS => {
                        debug!("Volume {} is still in use, attempt {}", name, attempt);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Volumes, container create, inspect and start. The container is
    /// discarded again when inspect or start fails.
    async fn create_and_start(
        &self,
        opts: &ExecutorOptions,
        name: &str,
        image: &str,
        entrypoint: &[String],
        helper: bool,
    ) -> Result<String, AntError> {
        let started = std::time::Instant::now();
        let mut host_config = HostConfig {
            privileged: Some(opts.privileged),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: Some(0),
            }),
            ..Default::default()
        };
        if !opts.network_mode.is_empty() {
            host_config.network_mode = Some(opts.network_mode.clone());
        }
        let shared = &opts.main_container;
        if shared.has_docker_volumes() {
            self.create_volumes(shared).await?;
            if has_volumes_from(shared) {
                host_config.volumes_from = Some(shared.volumes_from.clone());
            } else {
                host_config.mounts = Some(
                    volume_mounts(shared)
                        .into_iter()
                        .map(|m| Mount {
                            typ: Some(if m.bind {
                                MountTypeEnum::BIND
                            } else {
                                MountTypeEnum::VOLUME
                            }),
                            source: Some(m.source),
                            target: Some(m.target),
                            ..Default::default()
                        })
                        .collect(),
                );
            }
        }

        let config = Config {
            image: Some(image.to_string()),
            labels: Some(opts.pod_labels.clone()),
            env: Some(env_for(opts, helper)),
            working_dir: (!opts.working_directory.is_empty())
                .then(|| opts.working_directory.clone()),
            entrypoint: (!entrypoint.is_empty()).then(|| entrypoint.to_vec()),
            tty: Some(true),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(false),
            stdin_once: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| {
                docker_error(
                    format!(
                        "failed to create container {} elapsed {:?}",
                        name,
                        started.elapsed()
                    ),
                    e,
                )
            })?;

        if let Err(e) = self
            .docker
            .inspect_container(&created.id, None::<InspectContainerOptions>)
            .await
        {
            self.discard(&created.id).await;
            return Err(docker_error(format!("failed to inspect container {}", name), e));
        }
        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            self.discard(&created.id).await;
            return Err(docker_error(format!("failed to start container {}", name), e));
        }
        info!(
            "Created docker container {} image={} id={} helper={}",
            name, image, created.id, helper
        );
        Ok(created.id)
    }

    async fn discard(&self, id: &str) {
        let _ = self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: 0 }))
            .await;
        let _ = self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    }
}

#[async_trait::async_trait]
impl DockerAdapter for BollardAdapter {
    async fn pull(&self, image: &str) -> Result<(), AntError> {
        let registry = &self.config.registry;
        let credentials = if !registry.server.is_empty() && image.contains(&registry.server) {
            Some(DockerCredentials {
                username: Some(registry.username.clone()),
                password: Some(registry.password.clone()),
                serveraddress: Some(registry.server.clone()),
                ..Default::default()
            })
        } else {
            None
        };
        info!("Pulling docker image {} server={}", image, registry.server);
        let options = CreateImageOptions {
            from_image: image_reference(image),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, credentials)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| docker_error(format!("failed to pull image {}", image), e))?;
        Ok(())
    }

    async fn build(
        &self,
        opts: &ExecutorOptions,
        name: &str,
        image: &str,
        entrypoint: &[String],
        helper: bool,
    ) -> Result<String, AntError> {
        self.ensure_image(image).await?;
        let built = self.create_and_start(opts, name, image, entrypoint, helper).await;
        if owns_volumes(opts, helper) {
            or_unwind(built, || self.remove_volumes(&opts.main_container)).await
        } else {
            built
        }
    }

    async fn execute(
        &self,
        opts: &ExecutorOptions,
        container_id: &str,
        cmd: &str,
        helper: bool,
    ) -> Result<ExecHandle, AntError> {
        let cmds = exec_command(cmd, opts.execute_command_without_shell);
        debug!(
            "Executing in container {} command={:?} cwd={}",
            container_id, cmds, opts.working_directory
        );
        let inspected = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| docker_error(format!("failed to inspect container for execution {}", cmd), e))?;

        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    attach_stdin: Some(false),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    cmd: Some(cmds),
                    env: Some(env_for(opts, helper)),
                    working_dir: (!opts.working_directory.is_empty())
                        .then(|| opts.working_directory.clone()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| docker_error(format!("failed to create execution {}", cmd), e))?;

        let stream = ExecStream::default();
        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| docker_error(format!("failed to start execution {}", cmd), e))?;
        match started {
            StartExecResults::Attached { mut output, .. } => {
                let sink = stream.clone();
                let exec_id = exec.id.clone();
                tokio::spawn(async move {
                    while let Some(chunk) = output.next().await {
                        match chunk {
                            Ok(LogOutput::StdErr { message }) => sink.append_stderr(&message),
                            Ok(other) => sink.append_stdout(&other.into_bytes()),
                            Err(e) => {
                                warn!("Output stream of exec {} failed: {}", exec_id, e);
                                break;
                            }
                        }
                    }
                    sink.finish();
                });
            }
            StartExecResults::Detached => stream.finish(),
        }

        Ok(ExecHandle {
            id: exec.id,
            host: inspected
                .config
                .and_then(|c| c.hostname)
                .unwrap_or_default(),
            container_ip: inspected
                .network_settings
                .and_then(|n| n.ip_address)
                .unwrap_or_default(),
            stream,
        })
    }

    async fn is_execute_running(&self, exec_id: &str) -> Result<ExecStatus, AntError> {
        let inspected = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| docker_error(format!("failed to inspect execution {}", exec_id), e))?;
        Ok(ExecStatus {
            running: inspected.running.unwrap_or(false),
            exit_code: inspected.exit_code.unwrap_or(0) as i32,
        })
    }

    async fn stop(
        &self,
        id: &str,
        opts: &ExecutorOptions,
        timeout: Duration,
    ) -> Result<(), AntError> {
        info!("Stopping docker container {}", id);
        let mut errors = Vec::new();
        if let Err(e) = self
            .docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await
        {
            errors.push(docker_error(
                format!("failed to stop docker container {} timeout={:?}", id, timeout),
                e,
            ));
        }

        debug!("Removing docker container {}", id);
        if let Err(e) = self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    v: true,
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            errors.push(docker_error(format!("failed to remove docker container {}", id), e));
        }

        if let Err(err) = self.remove_volumes(&opts.main_container).await {
            error!("Failed to remove volumes of container {}: {}", id, err);
            errors.push(err);
        }
        AntError::aggregate(errors)
    }

    async fn list(&self) -> Result<Vec<ExecutorInfo>, AntError> {
        let options = ListContainersOptions::<String> {
            all: false,
            filters: HashMap::from([("status".to_string(), vec!["running".to_string()])]),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| docker_error("failed to list containers".to_string(), e))?;

        Ok(containers
            .into_iter()
            .map(|c| ExecutorInfo {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                method: TaskMethod::Docker,
                state: State::Running,
                started_at: Utc
                    .timestamp_opt(c.created.unwrap_or_default(), 0)
                    .single()
                    .unwrap_or_else(Utc::now),
                ended_at: None,
                labels: c.labels.unwrap_or_default(),
                annotations: HashMap::new(),
                host: String::new(),
                container_ip: String::new(),
            })
            .collect())
    }

    async fn runtime_info(&self, container: &str) -> String {
        let mut out = String::new();
        let mut logs = Box::pin(self.docker.logs(
            container,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: LOG_TAIL_LINES.to_string(),
                ..Default::default()
            }),
        ));
        while let Some(Ok(line)) = logs.next().await {
            out.push_str(&String::from_utf8_lossy(&line.into_bytes()));
        }
        match self.docker.info().await {
            Ok(info) => out.push_str(&serde_json::to_string(&info).unwrap_or_default()),
            Err(e) => out.push_str(&e.to_string()),
        }
        out
    }
}
