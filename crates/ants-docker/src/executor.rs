use crate::adapter::DockerAdapter;
use crate::runner::DockerCommandRunner;
use ants_core::base::BaseExecutor;
use ants_core::config::AntConfig;
use ants_core::error::AntError;
use ants_core::executor::{CommandRunner, Executor, ExecutorInfo};
use ants_core::options::ExecutorOptions;
use ants_core::state::State;
use ants_core::trace::JobTrace;
use ants_core::types::TaskMethod;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub(crate) const HELPER_SUFFIX: &str = "-helper";

/// The main container, its optional helper and the adapter that owns them.
/// Runners keep a reference for runtime dumps.
pub(crate) struct DockerContainer {
    pub base: BaseExecutor,
    pub adapter: Arc<dyn DockerAdapter>,
    pub helper_id: String,
}

impl DockerContainer {
    pub async fn runtime_info(&self) -> String {
        let opts = &self.base.options;
        format!(
            "[{}] container ID={} Image={} Helper={} HelperImage={} Labels={:?}\n{}",
            self.base.name,
            self.base.id,
            opts.main_container.image,
            self.helper_id,
            opts.helper_container.image,
            opts.pod_labels,
            self.adapter.runtime_info(&self.base.name).await
        )
    }
}

/// Executor backed by a Docker container plus an optional helper container.
pub struct DockerExecutor {
    container: Arc<DockerContainer>,
    lock: Mutex<()>,
}

impl DockerExecutor {
    /// Builds the helper container first, then the main one. A failed main
    /// build tears the helper down again.
    pub async fn new(
        config: Arc<AntConfig>,
        trace: Arc<dyn JobTrace>,
        opts: ExecutorOptions,
        adapter: Arc<dyn DockerAdapter>,
    ) -> Result<Self, AntError> {
        opts.validate()?;
        if opts.main_container.image.is_empty() {
            return Err(AntError::Validation("image not specified".to_string()));
        }

        let mut helper_id = String::new();
        if !opts.helper_container.image.is_empty() {
            helper_id = adapter
                .build(
                    &opts,
                    &format!("{}{}", opts.name, HELPER_SUFFIX),
                    &opts.helper_container.image,
                    &config.default_shell,
                    true,
                )
                .await?;
        }

        let id = match adapter
            .build(
                &opts,
                &opts.name,
                &opts.main_container.image,
                &config.default_shell,
                false,
            )
            .await
        {
            Ok(id) => id,
            Err(err) => {
                if !helper_id.is_empty() {
                    if let Err(stop_err) = adapter
                        .stop(&helper_id, &opts, config.termination_grace_period())
                        .await
                    {
                        warn!("Failed to remove helper container {}: {}", helper_id, stop_err);
                    }
                }
                return Err(err);
            }
        };

        let ant_id = config.id.clone();
        let base = BaseExecutor::new(id, config, trace, opts)?;
        base.write_trace(&format!(
            "preparing container {} by ant {}",
            base.name, ant_id
        ));
        base.write_trace_info(&format!(
            "using image {}",
            base.options.main_container.image
        ));
        info!("Docker executor {} created with container {}", base.name, base.id);

        Ok(Self {
            container: Arc::new(DockerContainer {
                base,
                adapter,
                helper_id,
            }),
            lock: Mutex::new(()),
        })
    }

    pub fn helper_id(&self) -> &str {
        &self.container.helper_id
    }

    async fn do_async_execute(
        &self,
        container_id: &str,
        cmd: &str,
        helper: bool,
    ) -> Result<Arc<dyn CommandRunner>, AntError> {
        let _guard = self.lock.lock().await;
        self.container.base.begin_execute(cmd).await?;
        let runner =
            DockerCommandRunner::start(self.container.clone(), container_id, cmd, helper).await?;
        Ok(Arc::new(runner))
    }
}

#[async_trait::async_trait]
impl Executor for DockerExecutor {
    fn id(&self) -> &str {
        &self.container.base.id
    }

    fn name(&self) -> &str {
        &self.container.base.name
    }

    fn method(&self) -> TaskMethod {
        TaskMethod::Docker
    }

    fn trace(&self) -> Arc<dyn JobTrace> {
        self.container.base.trace.clone()
    }

    async fn state(&self) -> State {
        self.container.base.state().await
    }

    async fn info(&self) -> ExecutorInfo {
        self.container.base.info().await
    }

    async fn async_execute(
        &self,
        _token: &CancellationToken,
        cmd: &str,
        _vars: &HashMap<String, String>,
    ) -> Result<Arc<dyn CommandRunner>, AntError> {
        let id = self.container.base.id.clone();
        self.do_async_execute(&id, cmd, false).await
    }

    async fn async_helper_execute(
        &self,
        _token: &CancellationToken,
        cmd: &str,
        _vars: &HashMap<String, String>,
    ) -> Result<Arc<dyn CommandRunner>, AntError> {
        if self.container.helper_id.is_empty() {
            return Err(AntError::Validation(format!(
                "no helper container for {}",
                self.container.base.name
            )));
        }
        let id = self.container.helper_id.clone();
        self.do_async_execute(&id, cmd, true).await
    }

    async fn stop(&self, _token: &CancellationToken) -> Result<(), AntError> {
        let _guard = self.lock.lock().await;
        let base = &self.container.base;
        if base.begin_stop().await.is_err() {
            return Err(AntError::AlreadyStopped(format!(
                "container [{} {}] is already stopped",
                base.id, base.name
            )));
        }
        base.write_trace_info("stopping container");

        let grace = base.config.termination_grace_period();
        let adapter = &self.container.adapter;
        let mut errors = Vec::new();
        if let Err(err) = adapter.stop(&base.id, &base.options, grace).await {
            errors.push(err);
        }
        if !self.container.helper_id.is_empty() {
            if let Err(err) = adapter
                .stop(&self.container.helper_id, &base.options, grace)
                .await
            {
                warn!(
                    "Failed to stop helper container {}: {}",
                    self.container.helper_id, err
                );
                errors.push(err);
            }
        }

        let elapsed = base.elapsed(base.ended_at().await);
        let result = AntError::aggregate(errors);
        match &result {
            Ok(()) => base.write_trace_info(&format!(
                "stopped container: Elapsed={} StopWait={:?}",
                elapsed, grace
            )),
            Err(err) => base.write_trace_error(&format!(
                "failed to stop container: Error={} Elapsed={} StopWait={:?}",
                err, elapsed, grace
            )),
        }
        result
    }

    async fn runtime_info(&self, _token: &CancellationToken) -> String {
        self.container.runtime_info().await
    }
}
