use ants_core::base::{BaseExecutor, RunnerBase};
use ants_core::error::AntError;
use ants_core::executor::{CommandOutput, CommandRunner};
use ants_core::future::{execute, Awaiter};
use std::collections::HashMap;
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sends `signal` to the whole process group led by `pid`. A group that has
/// already exited is not an error.
pub(crate) fn signal_group(pid: u32, signal: libc::c_int) -> Result<(), AntError> {
    let pgid = -(pid as libc::pid_t);
    let result = unsafe { libc::kill(pgid, signal) };
    if result != 0 {
        let os_error = std::io::Error::last_os_error();
        if os_error.raw_os_error() != Some(libc::ESRCH) {
            return Err(AntError::Process(format!(
                "failed to send signal {} to process group {}: {}",
                signal, pid, os_error
            )));
        }
    }
    Ok(())
}

fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// A `/bin/sh -c` child in its own process group.
pub struct ShellCommandRunner {
    base: RunnerBase,
    pid: u32,
    exited: Arc<AtomicBool>,
    awaiter: Mutex<Option<Awaiter<Output>>>,
}

impl ShellCommandRunner {
    /// Spawns the command immediately; output is collected in the background
    /// so a chatty child never blocks on a full pipe.
    pub(crate) fn spawn(
        token: &CancellationToken,
        executor: &BaseExecutor,
        cmd: &str,
        helper: bool,
        host: &str,
        vars: &HashMap<String, String>,
    ) -> Result<Self, AntError> {
        let base = RunnerBase::new(executor, cmd, helper, host);
        base.write_trace(&format!("$ {}", cmd));

        let env = if helper {
            &executor.options.helper_environment
        } else {
            &executor.options.environment
        };
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(cmd)
            .envs(env)
            .envs(vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if !executor.options.working_directory.is_empty() {
            command.current_dir(&executor.options.working_directory);
        }

        let child = command
            .spawn()
            .map_err(|e| AntError::Process(format!("failed to spawn '{}': {}", cmd, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| AntError::Process(format!("'{}' exited before it was tracked", cmd)))?;
        debug!("Spawned runner {} pid={} command={}", base.id, pid, cmd);

        let exited = Arc::new(AtomicBool::new(false));
        let flag = exited.clone();
        let awaiter = execute(
            token,
            move |_stop| async move {
                let res = child.wait_with_output().await;
                flag.store(true, Ordering::SeqCst);
                res.map_err(AntError::from)
            },
            Some(Box::new(move || {
                let _ = signal_group(pid, libc::SIGKILL);
            })),
        );

        Ok(Self {
            base,
            pid,
            exited,
            awaiter: Mutex::new(Some(awaiter)),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

#[async_trait::async_trait]
impl CommandRunner for ShellCommandRunner {
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
            AntError::Internal(format!("command '{}' was already awaited", self.base.command))
        })?;
        match awaiter.wait(token).await {
            Ok(output) => {
                let outcome = if output.status.success() {
                    Ok(())
                } else {
                    Err(AntError::CommandFailed {
                        command: self.base.command.clone(),
                        exit_code: output.status.code().unwrap_or(1),
                    })
                };
                let captured = CommandOutput {
                    stdout: output.stdout,
                    stderr: output.stderr,
                };
                self.base.finish(captured, outcome)
            }
            Err(err) => self.base.finish(CommandOutput::default(), Err(err)),
        }
    }

    async fn is_running(&self, _token: &CancellationToken) -> Result<bool, AntError> {
        Ok(!self.exited.load(Ordering::SeqCst) && process_alive(self.pid))
    }

    async fn stop(&self, _token: &CancellationToken, _timeout: Duration) -> Result<(), AntError> {
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        signal_group(self.pid, libc::SIGKILL)
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
