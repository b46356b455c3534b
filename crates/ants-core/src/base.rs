//! Bookkeeping shared by every backend: identity, state, timestamps and trace
//! formatting for executors, exit status and output capture for runners, and
//! the provider-side map of live executors.

use crate::config::AntConfig;
use crate::error::AntError;
use crate::executor::{CommandOutput, Executor, ExecutorInfo};
use crate::options::ExecutorOptions;
use crate::state::State;
use crate::trace::{JobTrace, TraceTag};
use crate::types::TaskMethod;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{info, warn};

const ANSI_BOLD_CYAN: &str = "\x1b[1;36m";
const ANSI_BOLD_GREEN: &str = "\x1b[1;32m";
const ANSI_BOLD_RED: &str = "\x1b[1;31m";
const ANSI_BOLD_YELLOW: &str = "\x1b[1;33m";
const ANSI_RESET: &str = "\x1b[0m";

/// Exit code recorded for a command abandoned through cancellation.
pub const CANCELLED_EXIT_CODE: i32 = -1;

fn trace_line(method: TaskMethod, name: &str, msg: &str) -> String {
    let helper = if name.contains("helper") { "-helper" } else { "" };
    format!(
        "[{} {} {}{}] {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        method,
        name,
        helper,
        msg
    )
}

#[derive(Debug, Clone)]
struct ExecutorStatus {
    state: State,
    ended_at: Option<DateTime<Utc>>,
    host: String,
    container_ip: String,
    dumped_runtime_info: bool,
}

/// State common to all executors. Backends embed one and delegate to it.
pub struct BaseExecutor {
    pub id: String,
    pub name: String,
    pub method: TaskMethod,
    pub config: Arc<AntConfig>,
    pub options: ExecutorOptions,
    pub trace: Arc<dyn JobTrace>,
    pub started_at: DateTime<Utc>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    status: RwLock<ExecutorStatus>,
}

impl BaseExecutor {
    pub fn new(
        id: String,
        config: Arc<AntConfig>,
        trace: Arc<dyn JobTrace>,
        options: ExecutorOptions,
    ) -> Result<Self, AntError> {
        options.validate()?;
        let method = options.method()?;
        Ok(Self {
            id,
            name: options.name.clone(),
            method,
            labels: options.pod_labels.clone(),
            annotations: options.pod_annotations.clone(),
            config,
            options,
            trace,
            started_at: Utc::now(),
            status: RwLock::new(ExecutorStatus {
                state: State::Creating,
                ended_at: None,
                host: String::new(),
                container_ip: String::new(),
                dumped_runtime_info: false,
            }),
        })
    }

    pub fn write_trace(&self, msg: &str) {
        self.trace
            .writeln(&trace_line(self.method, &self.name, msg), TraceTag::Exec);
    }

    pub fn write_trace_info(&self, msg: &str) {
        self.write_trace(&format!("{}{}{}", ANSI_BOLD_CYAN, msg, ANSI_RESET));
    }

    pub fn write_trace_success(&self, msg: &str) {
        self.write_trace(&format!("{}{}{}", ANSI_BOLD_GREEN, msg, ANSI_RESET));
    }

    pub fn write_trace_error(&self, msg: &str) {
        self.write_trace(&format!("{}{}{}", ANSI_BOLD_RED, msg, ANSI_RESET));
    }

    pub fn write_trace_warn(&self, msg: &str) {
        self.write_trace(&format!("{}{}{}", ANSI_BOLD_YELLOW, msg, ANSI_RESET));
    }

    pub async fn state(&self) -> State {
        self.status.read().await.state
    }

    pub async fn set_state(&self, state: State) {
        self.status.write().await.state = state;
    }

    pub async fn set_host(&self, host: &str, container_ip: &str) {
        let mut status = self.status.write().await;
        status.host = host.to_string();
        status.container_ip = container_ip.to_string();
    }

    pub async fn host(&self) -> String {
        self.status.read().await.host.clone()
    }

    pub async fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.status.read().await.ended_at
    }

    /// Marks the executor as running a new command, unless it is being removed.
    pub async fn begin_execute(&self, cmd: &str) -> Result<(), AntError> {
        let mut status = self.status.write().await;
        if status.state == State::Removing {
            let msg = format!(
                "failed to execute command '{}' because executor is already stopped",
                cmd
            );
            self.write_trace_error(&msg);
            return Err(AntError::AlreadyStopped(msg));
        }
        status.state = State::Running;
        Ok(())
    }

    /// Moves to `Removing` and stamps the end time. Fails if already removing.
    pub async fn begin_stop(&self) -> Result<(), AntError> {
        let mut status = self.status.write().await;
        if status.state == State::Removing {
            self.write_trace_error("cannot remove executor as it's already stopped");
            return Err(AntError::AlreadyStopped(format!(
                "executor [{}] is already stopped",
                self.name
            )));
        }
        status.state = State::Removing;
        status.ended_at = Some(Utc::now());
        Ok(())
    }

    /// True the first time it is called; runtime dumps go to the trace once.
    pub async fn claim_runtime_dump(&self) -> bool {
        let mut status = self.status.write().await;
        !std::mem::replace(&mut status.dumped_runtime_info, true)
    }

    pub fn elapsed(&self, ended_at: Option<DateTime<Utc>>) -> String {
        let end = ended_at.unwrap_or_else(Utc::now);
        format!("{}s", (end - self.started_at).num_seconds())
    }

    pub async fn info(&self) -> ExecutorInfo {
        let status = self.status.read().await;
        ExecutorInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            method: self.method,
            state: status.state,
            started_at: self.started_at,
            ended_at: status.ended_at,
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
            host: status.host.clone(),
            container_ip: status.container_ip.clone(),
        }
    }
}

impl std::fmt::Display for BaseExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ID={}, Name={}, Method={}", self.id, self.name, self.method)
    }
}

#[derive(Debug, Default)]
struct RunnerResult {
    output: CommandOutput,
    exit_code: i32,
    exit_message: String,
}

/// Exit status and captured output of one command.
pub struct RunnerBase {
    pub id: String,
    pub command: String,
    pub helper: bool,
    pub host: String,
    pub started_at: DateTime<Utc>,
    method: TaskMethod,
    name: String,
    debug: bool,
    trace: Arc<dyn JobTrace>,
    result: Mutex<RunnerResult>,
}

impl RunnerBase {
    pub fn new(executor: &BaseExecutor, command: &str, helper: bool, host: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            command: command.to_string(),
            helper,
            host: host.to_string(),
            started_at: Utc::now(),
            method: executor.method,
            name: if helper {
                format!("{}-helper", executor.name)
            } else {
                executor.name.clone()
            },
            debug: executor.options.debug,
            trace: executor.trace.clone(),
            result: Mutex::new(RunnerResult::default()),
        }
    }

    /// Helper output is only traced in debug mode.
    pub fn traced(&self) -> bool {
        self.debug || !self.helper
    }

    pub fn write_trace(&self, msg: &str) {
        if self.traced() {
            self.trace
                .writeln(&trace_line(self.method, &self.name, msg), TraceTag::Exec);
        }
    }

    pub fn write_dump(&self, dump: &str) {
        self.trace.writeln(dump, TraceTag::Dump);
    }

    fn elapsed(&self) -> String {
        format!("{}ms", (Utc::now() - self.started_at).num_milliseconds())
    }

    /// Records the terminal outcome of the command, flushes its output to the
    /// trace and returns the value `CommandRunner::wait` hands back.
    pub fn finish(
        &self,
        output: CommandOutput,
        outcome: Result<(), AntError>,
    ) -> Result<CommandOutput, AntError> {
        if self.traced() {
            if !output.stdout.is_empty() {
                self.trace.write(&output.stdout, TraceTag::Stdout);
            }
            if !output.stderr.is_empty() {
                self.trace.write(&output.stderr, TraceTag::Stderr);
            }
        }
        let mut result = self.result();
        result.output = output.clone();
        match outcome {
            Ok(()) => {
                result.exit_code = 0;
                result.exit_message.clear();
                info!(
                    "Command {} succeeded on {} ({}) stdout={} bytes elapsed={}",
                    self.id,
                    self.name,
                    self.command,
                    output.stdout.len(),
                    self.elapsed()
                );
                if self.traced() {
                    self.trace.writeln(
                        &trace_line(
                            self.method,
                            &self.name,
                            &format!(
                                "{}{} on Host={} Duration={}{}",
                                ANSI_BOLD_GREEN,
                                self.command,
                                self.host,
                                self.elapsed(),
                                ANSI_RESET
                            ),
                        ),
                        TraceTag::Exec,
                    );
                }
                Ok(output)
            }
            Err(err) => {
                result.exit_code = match &err {
                    AntError::CommandFailed { exit_code, .. } if *exit_code != 0 => *exit_code,
                    AntError::DeadlineExceeded => CANCELLED_EXIT_CODE,
                    _ => 1,
                };
                result.exit_message = format!(
                    "command terminated with exit-code={}: {}",
                    result.exit_code, err
                );
                warn!(
                    "Command {} failed on {} ({}) exit-code={} error={} elapsed={}",
                    self.id,
                    self.name,
                    self.command,
                    result.exit_code,
                    err,
                    self.elapsed()
                );
                if self.traced() {
                    self.trace.writeln(
                        &trace_line(
                            self.method,
                            &self.name,
                            &format!(
                                "{}{} failed to execute on Host={} ExitCode={} Error={} Duration={}{}",
                                ANSI_BOLD_RED,
                                self.command,
                                self.host,
                                result.exit_code,
                                err,
                                self.elapsed(),
                                ANSI_RESET
                            ),
                        ),
                        TraceTag::Exec,
                    );
                }
                Err(err)
            }
        }
    }

    fn result(&self) -> std::sync::MutexGuard<'_, RunnerResult> {
        match self.result.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn stdout(&self) -> Vec<u8> {
        self.result().output.stdout.clone()
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.result().output.stderr.clone()
    }

    pub fn exit_code(&self) -> i32 {
        self.result().exit_code
    }

    pub fn exit_message(&self) -> String {
        self.result().exit_message.clone()
    }
}

/// Exit code carried as the last token of a backend error message, e.g.
/// `command terminated with non-zero exit code: 2`.
pub fn exit_code_from_message(msg: &str) -> Option<i32> {
    msg.split_whitespace().last()?.parse().ok()
}

/// Live executors of one provider, keyed by id.
pub struct ExecutorMap<E: ?Sized> {
    executors: RwLock<HashMap<String, Arc<E>>>,
}

impl<E: Executor + ?Sized> ExecutorMap<E> {
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add(&self, executor: Arc<E>) {
        self.executors
            .write()
            .await
            .insert(executor.id().to_string(), executor);
    }

    /// Removes the executor with the given id, or else the first one with
    /// that name. Sweeps only know containers by name.
    pub async fn take(&self, id_or_name: &str) -> Option<Arc<E>> {
        let mut executors = self.executors.write().await;
        if let Some(executor) = executors.remove(id_or_name) {
            return Some(executor);
        }
        let id = executors
            .iter()
            .find(|(_, executor)| executor.name() == id_or_name)
            .map(|(id, _)| id.clone())?;
        executors.remove(&id)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<E>> {
        self.executors.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.executors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executors.read().await.is_empty()
    }

    /// Snapshot of every executor's info, taken without holding the map lock.
    pub async fn infos(&self) -> Vec<ExecutorInfo> {
        let snapshot: Vec<Arc<E>> = self.executors.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(snapshot.len());
        for executor in snapshot {
            infos.push(executor.info().await);
        }
        infos
    }
}

impl<E: Executor + ?Sized> Default for ExecutorMap<E> {
    fn default() -> Self {
        Self::new()
    }
}
