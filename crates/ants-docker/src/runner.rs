use crate::adapter::ExecStream;
use crate::executor::DockerContainer;
use ants_core::base::RunnerBase;
use ants_core::error::AntError;
use ants_core::executor::{CommandOutput, CommandRunner};
use ants_core::future::execute_polling;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const EXEC_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One exec session inside the main or helper container.
pub struct DockerCommandRunner {
    base: RunnerBase,
    container: Arc<DockerContainer>,
    exec_id: String,
    stream: ExecStream,
    cancel: CancellationToken,
}

impl DockerCommandRunner {
    pub(crate) async fn start(
        container: Arc<DockerContainer>,
        container_id: &str,
        cmd: &str,
        helper: bool,
    ) -> Result<Self, AntError> {
        let handle = container
            .adapter
            .execute(&container.base.options, container_id, cmd, helper)
            .await
            .map_err(|err| {
                container
                    .base
                    .write_trace_error(&format!("failed to execute '{}' due to {}", cmd, err));
                err
            })?;
        container
            .base
            .set_host(&handle.host, &handle.container_ip)
            .await;

        let base = RunnerBase::new(&container.base, cmd, helper, &handle.host);
        base.write_trace(&format!("$ {}", cmd));
        debug!("Started exec {} in {} command={}", handle.id, container_id, cmd);
        Ok(Self {
            base,
            container,
            exec_id: handle.id,
            stream: handle.stream,
            cancel: CancellationToken::new(),
        })
    }

    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    async fn dump_runtime_info(&self) {
        if self.container.base.claim_runtime_dump().await {
            self.base.write_dump(
                "*********************** <<DOCKER RUNTIME-INFO BEGIN>> **************************",
            );
            self.base.write_dump(&self.container.runtime_info().await);
            self.base.write_dump(
                "*********************** <<DOCKER RUNTIME-INFO END>>  **************************",
            );
        }
    }
}

#[async_trait::async_trait]
impl CommandRunner for DockerCommandRunner {
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
        let adapter = self.container.adapter.clone();
        let exec_id = self.exec_id.clone();
        let stream = self.stream.clone();
        let mut awaiter = execute_polling(
            &self.cancel,
            move |_stop| {
                let adapter = adapter.clone();
                let exec_id = exec_id.clone();
                let stream = stream.clone();
                async move {
                    let status = adapter.is_execute_running(&exec_id).await?;
                    if status.running || !stream.is_finished() {
                        Ok(None)
                    } else {
                        Ok(Some(status.exit_code))
                    }
                }
            },
            None,
            EXEC_POLL_INTERVAL,
        );

        let outcome = match awaiter.wait(token).await {
            Ok(0) => Ok(()),
            Ok(exit_code) => Err(AntError::CommandFailed {
                command: self.base.command.clone(),
                exit_code,
            }),
            Err(err) => Err(err),
        };
        let failed = outcome.is_err();
        let result = self.base.finish(self.stream.snapshot(), outcome);
        if failed {
            self.dump_runtime_info().await;
        }
        result
    }

    async fn is_running(&self, _token: &CancellationToken) -> Result<bool, AntError> {
        let status = self
            .container
            .adapter
            .is_execute_running(&self.exec_id)
            .await?;
        Ok(status.running)
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
