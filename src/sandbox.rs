// src/sandbox.rs
//! Process sandbox: turns code into a script, runs it as a child process
//! under a wall-clock budget and reports the outcome to waiting callers and
//! subscribed listeners.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;

use crate::command::{CommandBuilder, CommandMode, resolve_interpreter};
use crate::config::SandboxConfig;
use crate::errors::{Result, SandboxError};
use crate::interpreter::{CodeInterpreter, InterpreterIssue, PythonInterpreter};
use crate::limits::ExitCode;
use crate::listeners::{Listener, Listeners};
use crate::model::{Code, Lang, Output, OutputKind, PlaceholderDefinitions, PlaceholderLabel, resolve_all};
use crate::storage::{FileType, TempFileStorage};
use crate::task::{Completion, GroupId, IdGenerator, Task, TaskId};

const PURGE_INTERVAL: Duration = Duration::from_secs(5);

/// Cap on captured stdout and stderr, each, of one execution.
pub const MAX_OUTPUT_BYTES: u64 = 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq, Hash)]
pub enum Issue {
    #[error("interpretation failed: {0}")]
    Interpretation(#[from] InterpreterIssue),

    #[error("I/O failure: {0}")]
    Io(String),

    #[error("process exited with unexpected code {code}")]
    UnexpectedCode { code: i32, stderr: Option<String> },

    #[error("process was killed")]
    Killed,

    #[error("memory limit exceeded")]
    MemoryViolation,

    #[error("cpu time limit exceeded")]
    CpuTimeExceeded,

    #[error("execution was canceled")]
    Canceled,

    #[error("failed to parse output: {0}")]
    Parse(String),

    #[error("unknown failure: {description}")]
    Unknown { description: String, cause: Option<String> },
}

impl Issue {
    fn io(error: std::io::Error) -> Self {
        Issue::Io(error.to_string())
    }

    fn unknown(description: impl Into<String>) -> Self {
        Issue::Unknown { description: description.into(), cause: None }
    }
}

pub type ExecutionResult = std::result::Result<Output, Issue>;
pub type ExecutionTask = Task<ExecutionResult>;

/// Runs code units for tenant groups and reports outcomes asynchronously.
pub trait CodeExecutor: Send + Sync {
    fn lang(&self) -> Lang;

    /// Resolves `definitions`, interprets `code` and starts it. Never blocks
    /// on the execution itself.
    fn submit(
        &self,
        group: GroupId,
        code: &Code,
        call_args: &[PlaceholderLabel],
        definitions: &PlaceholderDefinitions,
    ) -> ExecutionTask;

    fn subscribe(&self, group: GroupId, listener: Arc<dyn Listener>);

    fn unsubscribe(&self, group: GroupId, listener: &Arc<dyn Listener>);

    fn close(&self);
}

struct Runtimes {
    processes: Runtime,
    scheduler: Runtime,
}

/// Child-process sandbox backed by two dedicated runtimes: one spawning and
/// waiting on processes, one for budget timers and listener delivery.
pub struct Sandbox {
    inner: Arc<Inner>,
    runtimes: Mutex<Option<Runtimes>>,
}

struct Inner {
    lang: Lang,
    config: SandboxConfig,
    interpreter: Box<dyn CodeInterpreter>,
    commands: CommandBuilder,
    storage: Option<TempFileStorage>,
    listeners: Listeners,
    in_flight: Mutex<HashMap<GroupId, HashMap<TaskId, Arc<Completion<ExecutionResult>>>>>,
    ids: IdGenerator,
    permits: Arc<Semaphore>,
    processes: Handle,
    scheduler: Handle,
    closed: AtomicBool,
}

impl Sandbox {
    /// Builds a sandbox for `lang`, probing for its interpreter binary.
    pub fn new(lang: Lang, config: SandboxConfig) -> Result<Self> {
        let interpreter: Box<dyn CodeInterpreter> = match lang {
            Lang::Python => Box::new(PythonInterpreter),
            Lang::JavaScript => return Err(SandboxError::UnsupportedLanguage(lang)),
        };
        let base = std::env::current_dir()?;
        let binary = resolve_interpreter(lang, &base, config.python_bin.as_deref())?;
        let commands = CommandBuilder::new(binary, config.mode);
        Self::with_parts(interpreter, commands, config)
    }

    pub fn with_parts(
        interpreter: Box<dyn CodeInterpreter>,
        commands: CommandBuilder,
        config: SandboxConfig,
    ) -> Result<Self> {
        let lang = interpreter.lang();
        let processes = Builder::new_multi_thread()
            .worker_threads(config.process_workers.max(1))
            .thread_name("sandbox-process")
            .enable_all()
            .build()?;
        let scheduler = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("sandbox-scheduler")
            .enable_time()
            .build()?;

        let storage = match commands.mode() {
            CommandMode::File => Some(TempFileStorage::open(&config.storage_dir, &lang.to_string())?),
            CommandMode::Inline => None,
        };

        let inner = Arc::new(Inner {
            lang,
            permits: Arc::new(Semaphore::new(config.max_processes.max(1))),
            config,
            interpreter,
            commands,
            storage,
            listeners: Listeners::new(),
            in_flight: Mutex::new(HashMap::new()),
            ids: IdGenerator::default(),
            processes: processes.handle().clone(),
            scheduler: scheduler.handle().clone(),
            closed: AtomicBool::new(false),
        });

        if inner.storage.is_some() {
            scheduler.spawn(purge_loop(Arc::downgrade(&inner)));
        }

        log::info!(
            "Sandbox for {} ready: interpreter={}, budget={}ms, limits={:?}",
            lang,
            inner.commands.interpreter().display(),
            inner.config.execution_budget.as_millis(),
            inner.config.limits()
        );

        Ok(Self { inner, runtimes: Mutex::new(Some(Runtimes { processes, scheduler })) })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    /// Number of tasks of `group` that have not finished yet.
    pub fn in_flight(&self, group: GroupId) -> usize {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&group)
            .map_or(0, HashMap::len)
    }

    /// Listener that hears about every group.
    pub fn subscribe_global(&self, listener: Arc<dyn Listener>) {
        self.inner.listeners.register_global(listener);
    }

    pub fn unsubscribe_global(&self, listener: &Arc<dyn Listener>) {
        self.inner.listeners.unregister_global(listener);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl CodeExecutor for Sandbox {
    fn lang(&self) -> Lang {
        self.inner.lang
    }

    fn submit(
        &self,
        group: GroupId,
        code: &Code,
        call_args: &[PlaceholderLabel],
        definitions: &PlaceholderDefinitions,
    ) -> ExecutionTask {
        let inner = &self.inner;
        let task_id = inner.ids.next_id();

        if inner.closed.load(Ordering::SeqCst) {
            return Task::ready(task_id, Err(Issue::unknown("sandbox is closed")));
        }

        let script = match resolve_all(definitions)
            .and_then(|values| inner.interpreter.to_executable_code(code, call_args, &values))
        {
            Ok(script) => script,
            Err(cause) => {
                log::warn!("Task {} of group {} rejected: {}", task_id, group, cause);
                let result: ExecutionResult = Err(Issue::Interpretation(cause));
                inner.notify_later(group, task_id, code.output, result.clone());
                return Task::ready(task_id, result);
            }
        };

        log::debug!("Submitting task {} of group {}", task_id, group);
        let completion = Completion::new();
        if !inner.track(group, task_id, completion.clone()) {
            return Task::ready(task_id, Err(Issue::unknown("sandbox is closed")));
        }

        let settle = Settle { inner: inner.clone(), group, task_id, completion: completion.clone() };
        let (started_tx, started_rx) = oneshot::channel();
        let process = inner
            .processes
            .spawn(inner.clone().execute(task_id, code.output, script, started_tx));
        inner
            .scheduler
            .spawn(inner.clone().supervise(code.output, process, started_rx, settle));

        Task::new(task_id, completion)
    }

    fn subscribe(&self, group: GroupId, listener: Arc<dyn Listener>) {
        self.inner.listeners.register(group, listener);
    }

    fn unsubscribe(&self, group: GroupId, listener: &Arc<dyn Listener>) {
        self.inner.listeners.unregister(group, listener);
    }

    /// Stops both runtimes; unfinished tasks resolve to `Canceled`.
    fn close(&self) {
        {
            // Flipped under the in-flight lock so no task is tracked after
            // the drain below.
            let _in_flight = self.inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        self.inner.permits.close();

        let runtimes = self.runtimes.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(runtimes) = runtimes {
            runtimes.processes.shutdown_background();
            runtimes.scheduler.shutdown_background();
        }

        let pending: Vec<_> = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .flat_map(|(_, tasks)| tasks.into_values())
            .collect();
        for completion in &pending {
            completion.complete(Err(Issue::Canceled));
        }
        log::info!("Sandbox for {} closed, {} task(s) canceled", self.inner.lang, pending.len());
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    /// Returns false once the sandbox is closed.
    fn track(&self, group: GroupId, task_id: TaskId, completion: Arc<Completion<ExecutionResult>>) -> bool {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        in_flight.entry(group).or_default().insert(task_id, completion);
        true
    }

    fn untrack(&self, group: GroupId, task_id: TaskId) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tasks) = in_flight.get_mut(&group) {
            tasks.remove(&task_id);
            if tasks.is_empty() {
                in_flight.remove(&group);
            }
        }
    }

    /// Delivers the outcome after the notify delay, off the caller's thread.
    fn notify_later(self: &Arc<Self>, group: GroupId, task_id: TaskId, kind: OutputKind, result: ExecutionResult) {
        let inner = self.clone();
        self.scheduler.spawn(async move {
            tokio::time::sleep(inner.config.notify_delay).await;
            log::debug!("Notifying listeners of group {} about task {}", group, task_id);
            inner.listeners.broadcast(group, task_id, kind, &result);
        });
    }

    fn prepare(&self, task_id: TaskId, script: &str) -> std::result::Result<Vec<String>, Issue> {
        let input = match (self.commands.mode(), &self.storage) {
            (CommandMode::Inline, _) => script.to_string(),
            (CommandMode::File, Some(storage)) => {
                let file_type = FileType::of(self.lang)
                    .ok_or_else(|| Issue::unknown(format!("no script file type for {}", self.lang)))?;
                let path = storage.save(task_id, script, file_type).map_err(Issue::io)?;
                path.display().to_string()
            }
            (CommandMode::File, None) => return Err(Issue::unknown("file mode without storage")),
        };
        let argv = self.commands.build(&input).map_err(|e| Issue::unknown(e.to_string()))?;
        Ok(match self.config.limits() {
            Some(limits) => limits.wrap(argv),
            None => argv,
        })
    }

    async fn execute(
        self: Arc<Self>,
        task_id: TaskId,
        kind: OutputKind,
        script: String,
        started: oneshot::Sender<()>,
    ) -> ExecutionResult {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return Err(Issue::Canceled);
        };

        let _cleanup = ScriptFile { inner: &self, task_id };
        let argv = self.prepare(task_id, &script)?;

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(Issue::io)?;
        let _ = started.send(());

        let captured = tokio::try_join!(
            read_capped(child.stdout.take()),
            read_capped(child.stderr.take())
        );
        let (stdout, stderr) = match captured {
            Ok(streams) => streams,
            Err(Capture::Io(e)) => return Err(Issue::io(e)),
            Err(Capture::Overflow) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                log::warn!("Task {} exceeded {} bytes of output, killed", task_id, MAX_OUTPUT_BYTES);
                return Err(Issue::unknown(format!("output exceeded {} bytes", MAX_OUTPUT_BYTES)));
            }
        };
        let status = child.wait().await.map_err(Issue::io)?;
        let output = std::process::Output { status, stdout, stderr };

        let result = classify(&output, kind);
        if let Err(issue) = &result {
            log::warn!("Task {} failed: {}", task_id, issue);
        }
        result
    }

    async fn supervise(
        self: Arc<Self>,
        kind: OutputKind,
        mut process: JoinHandle<ExecutionResult>,
        started: oneshot::Receiver<()>,
        settle: Settle,
    ) {
        let (group, task_id) = (settle.group, settle.task_id);

        // The budget counts from spawn, not from queueing behind the permit.
        let _ = started.await;

        let joined = match tokio::time::timeout(self.config.execution_budget, &mut process).await {
            Ok(joined) => joined,
            Err(_) => {
                log::warn!(
                    "Task {} of group {} exceeded {}ms, canceling",
                    task_id,
                    group,
                    self.config.execution_budget.as_millis()
                );
                process.abort();
                process.await
            }
        };

        self.untrack(group, task_id);
        let result = match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Issue::Canceled),
            Err(e) => {
                log::error!("Execution of task {} panicked: {}", task_id, e);
                settle.completion.break_with(format!("execution of task {} panicked: {}", task_id, e));
                return;
            }
        };

        settle.completion.complete(result.clone());
        tokio::time::sleep(self.config.notify_delay).await;
        log::debug!("Notifying listeners of group {} about task {}", group, task_id);
        self.listeners.broadcast(group, task_id, kind, &result);
    }
}

/// Resolves a supervised task to `Canceled` when its supervisor is dropped
/// before finishing, e.g. unpolled by a runtime shutdown.
struct Settle {
    inner: Arc<Inner>,
    group: GroupId,
    task_id: TaskId,
    completion: Arc<Completion<ExecutionResult>>,
}

impl Drop for Settle {
    fn drop(&mut self) {
        self.inner.untrack(self.group, self.task_id);
        if self.completion.complete(Err(Issue::Canceled)) {
            log::debug!("Task {} of group {} dropped unfinished", self.task_id, self.group);
        }
    }
}

enum Capture {
    Io(std::io::Error),
    Overflow,
}

/// Reads a child stream to EOF, failing as soon as it passes [`MAX_OUTPUT_BYTES`].
async fn read_capped(stream: Option<impl AsyncRead + Unpin>) -> std::result::Result<Vec<u8>, Capture> {
    let mut buf = Vec::new();
    if let Some(stream) = stream {
        stream
            .take(MAX_OUTPUT_BYTES + 1)
            .read_to_end(&mut buf)
            .await
            .map_err(Capture::Io)?;
    }
    if buf.len() as u64 > MAX_OUTPUT_BYTES {
        return Err(Capture::Overflow);
    }
    Ok(buf)
}

/// Schedules the script file of a task for deletion however the execution ends.
struct ScriptFile<'a> {
    inner: &'a Inner,
    task_id: TaskId,
}

impl Drop for ScriptFile<'_> {
    fn drop(&mut self) {
        if let (Some(storage), Some(file_type)) = (&self.inner.storage, FileType::of(self.inner.lang)) {
            storage.schedule_deletion(self.task_id, file_type);
        }
    }
}

async fn purge_loop(inner: Weak<Inner>) {
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        if let Some(storage) = &inner.storage {
            let purged = storage.purge_scheduled();
            if purged > 0 {
                log::debug!("Purged {} script file(s)", purged);
            }
        }
    }
}

/// Maps a finished process to an outcome: exit code 0 parses stdout, known
/// signal codes map to resource issues, anything else is unexpected.
pub fn classify(output: &std::process::Output, kind: OutputKind) -> ExecutionResult {
    let Some(raw) = ExitCode::raw(&output.status) else {
        return Err(Issue::unknown(format!("process ended without exit code: {}", output.status)));
    };
    match ExitCode::parse(raw) {
        ExitCode::Success => {
            let stdout = String::from_utf8(output.stdout.clone())
                .map_err(|e| Issue::Parse(format!("stdout is not valid UTF-8: {}", e)))?;
            parse_output(kind, &stdout)
        }
        ExitCode::SigKill => Err(Issue::Killed),
        ExitCode::SigSegv => Err(Issue::MemoryViolation),
        ExitCode::SigCpu => Err(Issue::CpuTimeExceeded),
        ExitCode::Unknown(code) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(Issue::UnexpectedCode { code, stderr: (!stderr.is_empty()).then_some(stderr) })
        }
    }
}

/// Parses printed stdout according to the declared output kind.
pub fn parse_output(kind: OutputKind, stdout: &str) -> ExecutionResult {
    let text = stdout
        .strip_suffix("\r\n")
        .or_else(|| stdout.strip_suffix('\n'))
        .unwrap_or(stdout);
    match kind {
        OutputKind::Str => Ok(Output::Str(text.to_string())),
        OutputKind::Bool => match text {
            "True" => Ok(Output::Bool(true)),
            "False" => Ok(Output::Bool(false)),
            other => Err(Issue::Parse(format!("expected True or False, got '{}'", other))),
        },
    }
}
