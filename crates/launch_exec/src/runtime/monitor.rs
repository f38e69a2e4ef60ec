//! Supervised execution of one local process
//!
//! A [`ManagedProcess`] owns the description of a unit. [`ManagedProcess::execute`]
//! resolves it against the [`ExecutionContext`], registers the unit's event
//! handlers and hands the lifecycle over to a supervisor task:
//!
//! ```text
//! NotStarted -> Starting -> Running -> (ShuttingDown ->) Exited -> Starting (respawn)
//!                                                              \-> Cleaned
//! ```
//!
//! Inbound requests (shutdown, raw signals, stdin data) reach the supervisor
//! through a command channel only. Completion is reported exactly once
//! through the returned [`Completion`].

use crate::config::substitution::{parse_bool, SubstitutionContext, SubstitutionError};
use crate::context::{ExecutionContext, HandlerId};
use crate::description::{DescriptionError, ProcessDescription, ProcessSpec};
use crate::events::{
    Event, EventKind, OutputStream, ProcessDetails, ProcessSignal, UnitId, UnitMatcher,
};
use crate::runtime::descendants::{self, DescendantTracker, POLL_INTERVAL};
use crate::runtime::escalation::{parse_timeout, ShutdownTimers, DEFAULT_ESCALATION_TIMEOUT};
use crate::runtime::launcher::{self, OutputReader, SpawnedProcess};
use crate::runtime::output::{
    LoggerFactory, OutputConfigError, OutputDestination, StandardLoggers,
};
use crate::runtime::relay::{OutputFormat, OutputRelay, RelayMode, DEFAULT_OUTPUT_FORMAT};
use crate::runtime::respawn::RespawnPolicy;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

const READ_CHUNK_SIZE: usize = 4096;

/// How long output is still read after the child exited, when child
/// processes keep its stdout/stderr open
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Lifecycle of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    NotStarted,
    Starting,
    Running,
    /// Shutdown in progress; carries the last signal of the escalation
    ShuttingDown(ProcessSignal),
    /// The current spawn exited with this return code
    Exited(Option<i32>),
    /// Finalized, completion reported
    Cleaned,
}

impl LifecycleState {
    pub fn is_alive(&self) -> bool {
        matches!(
            self,
            LifecycleState::Running | LifecycleState::ShuttingDown(_)
        )
    }
}

/// How a unit ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// The launch was shutting down before anything was spawned
    Skipped,
    /// The last spawn exited with this return code
    Finished(Option<i32>),
    /// The process could not be spawned
    SpawnFailed,
    /// The supervisor task was dropped before finishing
    Abandoned,
}

/// Respawn option: a literal, or a substitution evaluated at execute time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespawnSetting {
    Bool(bool),
    Expr(String),
}

impl Default for RespawnSetting {
    fn default() -> Self {
        RespawnSetting::Bool(false)
    }
}

impl From<bool> for RespawnSetting {
    fn from(value: bool) -> Self {
        RespawnSetting::Bool(value)
    }
}

/// Execution options of a unit
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Run the command through the system shell
    pub shell: bool,
    /// Attach stdout/stderr to pseudo-terminals
    pub emulate_tty: bool,
    /// Output destination: `screen`, `log` or `both`
    pub output: String,
    /// Line template with `{line}` and `{name}` keys
    pub output_format: String,
    /// Keep the whole output for later retrieval
    pub cached_output: bool,
    /// Log the final command before spawning
    pub log_cmd: bool,
    /// Grace period after SIGINT, defaults to the `sigterm_timeout` launch configuration
    pub sigterm_timeout: Option<Duration>,
    /// Grace period after SIGTERM, defaults to the `sigkill_timeout` launch configuration
    pub sigkill_timeout: Option<Duration>,
    pub respawn: RespawnSetting,
    pub respawn_delay: Option<Duration>,
    /// Negative for unlimited
    pub respawn_max_retries: i64,
    /// Wait for descendants holding the child's stdio before finishing
    pub wait_on_child_processes: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            shell: false,
            emulate_tty: false,
            output: "log".to_string(),
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            cached_output: false,
            log_cmd: false,
            sigterm_timeout: None,
            sigkill_timeout: None,
            respawn: RespawnSetting::default(),
            respawn_delay: None,
            respawn_max_retries: -1,
            wait_on_child_processes: false,
        }
    }
}

/// Requests routed from the event bus to a unit's supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
enum UnitCommand {
    Shutdown { send_sigint: bool },
    Signal(ProcessSignal),
    Stdin(Vec<u8>),
}

/// Map an inbound event to a command for the unit, if it is addressed to it
fn route(event: &Event, unit: UnitId, name: &str, noninteractive: bool) -> Option<UnitCommand> {
    let addressed = |target: &UnitMatcher| target.matches(unit, name);
    match event {
        Event::RequestShutdown { target } if addressed(target) => {
            Some(UnitCommand::Shutdown { send_sigint: true })
        }
        Event::RequestSignal { signal, target } if addressed(target) => {
            Some(UnitCommand::Signal(*signal))
        }
        Event::StdinData { target, data } if addressed(target) => {
            Some(UnitCommand::Stdin(data.clone()))
        }
        // An interactive Ctrl+C already reached the child through the terminal
        Event::GlobalShutdown { due_to_interrupt } => Some(UnitCommand::Shutdown {
            send_sigint: !*due_to_interrupt || noninteractive,
        }),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct Status {
    state: LifecycleState,
    details: Option<ProcessDetails>,
    return_code: Option<i32>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle on a unit's completion
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<Option<UnitOutcome>>,
}

impl Completion {
    fn ready(outcome: UnitOutcome) -> Self {
        let (_tx, rx) = watch::channel(Some(outcome));
        Self { rx }
    }

    /// Wait until the unit has finalized
    pub async fn wait(mut self) -> UnitOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(UnitOutcome::Abandoned),
            Err(_) => UnitOutcome::Abandoned,
        }
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

/// A supervised local process
pub struct ManagedProcess {
    unit: UnitId,
    description: ProcessDescription,
    options: ExecuteOptions,
    loggers: Arc<dyn LoggerFactory>,
    executed: AtomicBool,
    shutdown_before_execute: AtomicBool,
    name: OnceLock<String>,
    status: Arc<Mutex<Status>>,
    relay: OnceLock<Arc<Mutex<OutputRelay>>>,
    commands: OnceLock<mpsc::UnboundedSender<UnitCommand>>,
}

impl ManagedProcess {
    pub fn new(
        description: ProcessDescription,
        options: ExecuteOptions,
        loggers: Arc<dyn LoggerFactory>,
    ) -> Self {
        Self {
            unit: UnitId::next(),
            description,
            options,
            loggers,
            executed: AtomicBool::new(false),
            shutdown_before_execute: AtomicBool::new(false),
            name: OnceLock::new(),
            status: Arc::new(Mutex::new(Status::default())),
            relay: OnceLock::new(),
            commands: OnceLock::new(),
        }
    }

    /// Unit with the default options and [`StandardLoggers`]
    pub fn with_defaults(description: ProcessDescription) -> Self {
        Self::new(description, ExecuteOptions::default(), Arc::new(StandardLoggers))
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit
    }

    /// Resolved name, available once executed
    pub fn name(&self) -> Option<&str> {
        self.name.get().map(String::as_str)
    }

    pub fn state(&self) -> LifecycleState {
        lock(&self.status).state
    }

    /// Details of the latest spawn
    pub fn process_details(&self) -> Option<ProcessDetails> {
        lock(&self.status).details.clone()
    }

    /// Return code of the latest spawn
    pub fn return_code(&self) -> Option<i32> {
        lock(&self.status).return_code
    }

    /// Cached stdout, when `cached_output` is enabled
    pub fn stdout(&self) -> Result<String, ProcessError> {
        self.cached(OutputStream::Stdout)
    }

    /// Cached stderr, when `cached_output` is enabled
    pub fn stderr(&self) -> Result<String, ProcessError> {
        self.cached(OutputStream::Stderr)
    }

    fn cached(&self, stream: OutputStream) -> Result<String, ProcessError> {
        if !self.options.cached_output {
            return Err(ProcessError::OutputNotCached(self.label()));
        }
        Ok(self
            .relay
            .get()
            .map(|relay| lock(relay).cached(stream).to_string())
            .unwrap_or_default())
    }

    fn label(&self) -> String {
        self.name()
            .map(str::to_string)
            .or_else(|| self.description.name.clone())
            .unwrap_or_else(|| self.unit.to_string())
    }

    /// Begin a graceful shutdown of this unit. Before execution it prevents
    /// the spawn; after finalization it does nothing.
    pub fn request_shutdown(&self) {
        match self.commands.get() {
            Some(tx) => {
                let _ = tx.send(UnitCommand::Shutdown { send_sigint: true });
            }
            None => self.shutdown_before_execute.store(true, Ordering::SeqCst),
        }
    }

    /// Start supervising the process. Must be called within a tokio runtime.
    ///
    /// Fails on a second call and on invalid configuration. Spawn failures
    /// are reported through the [`Completion`] instead.
    pub fn execute(&self, ctx: &Arc<ExecutionContext>) -> Result<Completion, ProcessError> {
        if self.executed.swap(true, Ordering::SeqCst) {
            return Err(ProcessError::AlreadyExecuted(self.label()));
        }

        let emulate_tty = match ctx.launch_configuration("emulate_tty") {
            Some(value) => parse_bool(value).ok_or_else(|| ProcessError::InvalidOption {
                option: "emulate_tty".to_string(),
                value: value.to_string(),
            })?,
            None => self.options.emulate_tty,
        };
        let spec = self
            .description
            .prepare(ctx, self.options.shell, emulate_tty)?;
        let _ = self.name.set(spec.name.clone());

        let destination = OutputDestination::resolve(&self.options.output)?;
        let sigterm_timeout =
            resolve_timeout(ctx, "sigterm_timeout", self.options.sigterm_timeout)?;
        let sigkill_timeout =
            resolve_timeout(ctx, "sigkill_timeout", self.options.sigkill_timeout)?;
        let respawn = RespawnPolicy::new(
            resolve_respawn(ctx, &self.options.respawn)?,
            self.options.respawn_delay,
            self.options.respawn_max_retries,
        );

        if ctx.is_shutdown() {
            log::debug!("[{}] launch is shutting down, not starting process", spec.name);
            lock(&self.status).state = LifecycleState::Cleaned;
            return Ok(Completion::ready(UnitOutcome::Skipped));
        }

        let mode = if self.options.cached_output {
            RelayMode::CacheAll
        } else {
            RelayMode::LineAssembling
        };
        let relay = Arc::new(Mutex::new(OutputRelay::new(
            mode,
            OutputFormat::new(self.options.output_format.as_str()),
            spec.name.as_str(),
            self.loggers.output_sinks(&spec.name, destination),
        )));
        let _ = self.relay.set(relay.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let noninteractive = ctx.noninteractive();
        let handlers = [
            EventKind::RequestShutdown,
            EventKind::RequestSignal,
            EventKind::StdinData,
            EventKind::GlobalShutdown,
        ]
        .into_iter()
        .map(|kind| {
            let tx = tx.clone();
            let unit = self.unit;
            let name = spec.name.clone();
            ctx.bus().subscribe(kind, move |event| {
                if let Some(command) = route(event, unit, &name, noninteractive) {
                    let _ = tx.send(command);
                }
            })
        })
        .collect();
        let _ = self.commands.set(tx);
        if self.shutdown_before_execute.load(Ordering::SeqCst) {
            self.request_shutdown();
        }

        let (done, done_rx) = watch::channel(None);
        let supervisor = Supervisor {
            ctx: ctx.clone(),
            unit: self.unit,
            spec,
            log_cmd: self.options.log_cmd,
            sigterm_timeout,
            sigkill_timeout,
            respawn,
            wait_on_child_processes: self.options.wait_on_child_processes,
            status: self.status.clone(),
            relay,
            commands: rx,
            handlers,
            done,
            shutdown_requested: false,
        };
        tokio::spawn(supervisor.run());

        Ok(Completion { rx: done_rx })
    }
}

/// Explicit value, else the launch configuration `key`, else the default
fn resolve_timeout(
    ctx: &ExecutionContext,
    key: &str,
    explicit: Option<Duration>,
) -> Result<Duration, ProcessError> {
    if let Some(timeout) = explicit {
        return Ok(timeout);
    }
    match ctx.launch_configuration(key) {
        Some(value) => parse_timeout(value).ok_or_else(|| ProcessError::InvalidOption {
            option: key.to_string(),
            value: value.to_string(),
        }),
        None => Ok(DEFAULT_ESCALATION_TIMEOUT),
    }
}

fn resolve_respawn(ctx: &ExecutionContext, setting: &RespawnSetting) -> Result<bool, ProcessError> {
    match setting {
        RespawnSetting::Bool(value) => Ok(*value),
        RespawnSetting::Expr(expr) => {
            let value = SubstitutionContext::new()
                .with_args(ctx.launch_configurations().clone())
                .substitute(expr)
                .map_err(|source| ProcessError::Substitution {
                    option: "respawn".to_string(),
                    source,
                })?;
            parse_bool(&value).ok_or(ProcessError::InvalidOption {
                option: "respawn".to_string(),
                value,
            })
        }
    }
}

/// Readable ends of the stdout and stderr of one spawn
struct OutputStreams {
    stdout: OutputReader,
    stderr: OutputReader,
    stdout_open: bool,
    stderr_open: bool,
}

impl OutputStreams {
    fn is_open(&self) -> bool {
        self.stdout_open || self.stderr_open
    }
}

/// Task driving the spawn cycles of one unit
struct Supervisor {
    ctx: Arc<ExecutionContext>,
    unit: UnitId,
    spec: ProcessSpec,
    log_cmd: bool,
    sigterm_timeout: Duration,
    sigkill_timeout: Duration,
    respawn: RespawnPolicy,
    wait_on_child_processes: bool,
    status: Arc<Mutex<Status>>,
    relay: Arc<Mutex<OutputRelay>>,
    commands: mpsc::UnboundedReceiver<UnitCommand>,
    handlers: Vec<HandlerId>,
    done: watch::Sender<Option<UnitOutcome>>,
    shutdown_requested: bool,
}

impl Supervisor {
    async fn run(mut self) {
        let outcome = self.supervise().await;
        self.finalize(outcome);
    }

    fn set_state(&self, state: LifecycleState) {
        lock(&self.status).state = state;
    }

    fn shutting_down(&self) -> bool {
        self.shutdown_requested || self.ctx.is_shutdown()
    }

    async fn supervise(&mut self) -> UnitOutcome {
        let mut last: Option<Option<i32>> = None;
        loop {
            while let Ok(command) = self.commands.try_recv() {
                self.apply_idle(command);
            }
            if self.shutdown_requested {
                return match last {
                    Some(code) => UnitOutcome::Finished(code),
                    None => UnitOutcome::Skipped,
                };
            }

            self.set_state(LifecycleState::Starting);
            if self.log_cmd {
                log::info!(
                    "[{}] process details: cmd=[{}], cwd='{}', custom_env?={}",
                    self.spec.name,
                    self.spec.cmd.join(", "),
                    self.spec
                        .cwd
                        .as_ref()
                        .map(|cwd| cwd.display().to_string())
                        .unwrap_or_else(|| "None".to_string()),
                    self.spec.env.is_some()
                );
            }

            let process = match launcher::spawn(&self.spec) {
                Ok(process) => process,
                Err(e) => {
                    log::error!("[{}] failed to launch process: {}", self.spec.name, e);
                    return UnitOutcome::SpawnFailed;
                }
            };

            let code = self.run_cycle(process).await;
            last = Some(code);

            if self.shutting_down() || !self.respawn.enabled {
                return UnitOutcome::Finished(code);
            }
            if !self.respawn.try_consume() {
                log::error!(
                    "[{}] process exited with code {}, not respawning after {} retries",
                    self.spec.name,
                    display_code(code),
                    self.respawn.retries()
                );
                return UnitOutcome::Finished(code);
            }
            if let Some(delay) = self.respawn.effective_delay() {
                if !self.wait_respawn_delay(delay).await {
                    return UnitOutcome::Finished(code);
                }
            }
            log::info!(
                "[{}] respawning process (retry {})",
                self.spec.name,
                self.respawn.retries()
            );
        }
    }

    /// Handle a command while no process is alive
    fn apply_idle(&mut self, command: UnitCommand) {
        match command {
            UnitCommand::Shutdown { .. } => self.shutdown_requested = true,
            UnitCommand::Signal(signal) => log::debug!(
                "[{}] process is not running, ignoring '{}'",
                self.spec.name,
                signal
            ),
            UnitCommand::Stdin(data) => log::debug!(
                "[{}] process is not running, dropping {} bytes of stdin",
                self.spec.name,
                data.len()
            ),
        }
    }

    /// Returns false when a shutdown arrived during the delay
    async fn wait_respawn_delay(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => {
                        self.apply_idle(command);
                        if self.shutdown_requested {
                            return false;
                        }
                    }
                    None => {
                        (&mut sleep).await;
                        return true;
                    }
                },
                _ = &mut sleep => return true,
            }
        }
    }

    /// One spawn cycle, from start to exit. Returns the return code.
    async fn run_cycle(&mut self, process: SpawnedProcess) -> Option<i32> {
        let SpawnedProcess {
            pid,
            mut child,
            stdin,
            stdout,
            stderr,
        } = process;
        let mut stdin = stdin;
        let mut streams = OutputStreams {
            stdout,
            stderr,
            stdout_open: true,
            stderr_open: true,
        };

        let inodes = if self.wait_on_child_processes {
            descendants::stdio_inodes(pid)
        } else {
            HashSet::new()
        };

        let details = ProcessDetails {
            unit: self.unit,
            name: self.spec.name.clone(),
            pid,
            cmd: self.spec.cmd.clone(),
            cwd: self.spec.cwd.clone(),
            env: self.spec.env.clone(),
        };
        {
            let mut status = lock(&self.status);
            status.state = LifecycleState::Running;
            status.details = Some(details.clone());
            status.return_code = None;
        }
        log::info!("[{}] process started with pid [{}]", self.spec.name, pid);
        self.ctx.emit_async(Event::ProcessStarted(details.clone())).await;

        let mut timers: Option<ShutdownTimers> = None;
        let mut exit: Option<Option<i32>> = None;
        // Set once the child is reaped; bounds the read of its remaining output
        let mut drain_deadline: Option<Instant> = None;
        let mut commands_open = true;
        let mut stdout_buf = vec![0u8; READ_CHUNK_SIZE];
        let mut stderr_buf = vec![0u8; READ_CHUNK_SIZE];

        while exit.is_none() || streams.is_open() {
            let deadline = timers.as_ref().and_then(ShutdownTimers::next_deadline);
            tokio::select! {
                status = child.wait(), if exit.is_none() => {
                    let code = match status {
                        Ok(status) => launcher::returncode(status),
                        Err(e) => {
                            log::error!("[{}] failed to wait for process: {}", self.spec.name, e);
                            None
                        }
                    };
                    if let Some(timers) = timers.as_mut() {
                        timers.cancel();
                    }
                    exit = Some(code);
                    drain_deadline = Some(Instant::now() + OUTPUT_DRAIN_GRACE);
                    stdin = None;
                    let mut status = lock(&self.status);
                    status.state = LifecycleState::Exited(code);
                    status.return_code = code;
                }
                read = streams.stdout.read_chunk(&mut stdout_buf), if streams.stdout_open => {
                    streams.stdout_open = self.relay_read(OutputStream::Stdout, pid, read, &stdout_buf);
                }
                read = streams.stderr.read_chunk(&mut stderr_buf), if streams.stderr_open => {
                    streams.stderr_open = self.relay_read(OutputStream::Stderr, pid, read, &stderr_buf);
                }
                command = self.commands.recv(), if commands_open => match command {
                    None => commands_open = false,
                    Some(UnitCommand::Shutdown { send_sigint }) => {
                        self.shutdown_requested = true;
                        if exit.is_some() {
                            log::debug!("[{}] shutdown requested, no longer draining output", self.spec.name);
                            break;
                        }
                        if timers.is_none() {
                            timers = Some(self.begin_shutdown(&mut child, pid, send_sigint));
                        }
                    }
                    Some(UnitCommand::Signal(signal)) => {
                        if exit.is_none() {
                            log::info!("[{}] sending signal '{}' to process", self.spec.name, signal);
                            self.deliver(&mut child, pid, signal);
                        } else {
                            log::debug!("[{}] process has exited, ignoring '{}'", self.spec.name, signal);
                        }
                    }
                    Some(UnitCommand::Stdin(data)) => match stdin.as_mut() {
                        Some(writer) => {
                            let written = match writer.write_all(&data).await {
                                Ok(()) => writer.flush().await,
                                Err(e) => Err(e),
                            };
                            if let Err(e) = written {
                                log::debug!("[{}] failed to write to stdin: {}", self.spec.name, e);
                                stdin = None;
                            }
                        }
                        None => log::debug!(
                            "[{}] stdin is closed, dropping {} bytes",
                            self.spec.name,
                            data.len()
                        ),
                    },
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(timers) = timers.as_mut() {
                        while let Some(step) = timers.fire_due(Instant::now()) {
                            log::warn!(
                                "process[{}] failed to terminate '{}' seconds after receiving '{}', escalating to '{}'",
                                self.spec.name,
                                step.after.as_secs_f64(),
                                step.previous,
                                step.next
                            );
                            self.set_state(LifecycleState::ShuttingDown(step.next));
                            self.deliver(&mut child, pid, step.next);
                        }
                    }
                }
                _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)), if drain_deadline.is_some() => {
                    log::debug!("[{}] output is still open after exit, held by child processes", self.spec.name);
                    break;
                }
            }
        }
        drop(stdin);
        drop(child);

        let returncode = exit.flatten();

        if !inodes.is_empty() && !self.shutting_down() {
            self.wait_for_descendants(inodes, pid, &mut streams).await;
        }
        drop(streams);
        lock(&self.relay).flush(self.shutting_down());

        match returncode {
            Some(0) => log::info!(
                "[{}] process has finished cleanly [pid {}]",
                self.spec.name,
                pid
            ),
            code => log::error!(
                "[{}] process has died [pid {}, exit code {}, cmd '{}']",
                self.spec.name,
                pid,
                display_code(code),
                self.spec.command_line()
            ),
        }
        self.ctx
            .emit_async(Event::ProcessExited {
                details,
                returncode,
            })
            .await;

        returncode
    }

    /// Relay the result of a read. Returns whether the stream is still open.
    fn relay_read(
        &self,
        stream: OutputStream,
        pid: u32,
        read: std::io::Result<usize>,
        buf: &[u8],
    ) -> bool {
        match read {
            Ok(0) => false,
            Ok(n) => {
                self.relay_output(stream, pid, &buf[..n]);
                true
            }
            Err(e) => {
                log::debug!("[{}] {:?} closed: {}", self.spec.name, stream, e);
                false
            }
        }
    }

    fn relay_output(&self, stream: OutputStream, pid: u32, data: &[u8]) {
        self.ctx.emit(Event::ProcessOutput {
            unit: self.unit,
            name: self.spec.name.clone(),
            pid,
            stream,
            data: data.to_vec(),
        });
        lock(&self.relay).push(stream, data);
    }

    /// Send SIGINT (unless the terminal already did) and arm the escalation
    fn begin_shutdown(&self, child: &mut Child, pid: u32, send_sigint: bool) -> ShutdownTimers {
        if send_sigint {
            log::info!(
                "[{}] sending signal '{}' to process",
                self.spec.name,
                ProcessSignal::Interrupt
            );
            self.deliver(child, pid, ProcessSignal::Interrupt);
        }
        self.set_state(LifecycleState::ShuttingDown(ProcessSignal::Interrupt));
        ShutdownTimers::schedule(Instant::now(), self.sigterm_timeout, self.sigkill_timeout)
    }

    #[cfg(unix)]
    fn deliver(&self, _child: &mut Child, pid: u32, signal: ProcessSignal) {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), signal.as_nix()) {
            Ok(()) => {}
            Err(Errno::ESRCH) => log::debug!(
                "[{}] process [pid {}] is already gone, '{}' not delivered",
                self.spec.name,
                pid,
                signal
            ),
            Err(e) => log::error!(
                "[{}] failed to send '{}' to process [pid {}]: {}",
                self.spec.name,
                signal,
                pid,
                e
            ),
        }
    }

    #[cfg(not(unix))]
    fn deliver(&self, child: &mut Child, pid: u32, signal: ProcessSignal) {
        match signal {
            ProcessSignal::Interrupt => {
                log::warn!(
                    "[{}] '{}' is not supported on this platform, sending '{}' instead",
                    self.spec.name,
                    signal,
                    ProcessSignal::Terminate
                );
            }
            ProcessSignal::Terminate | ProcessSignal::Kill => {}
            other => {
                log::warn!(
                    "[{}] '{}' is not supported on this platform",
                    self.spec.name,
                    other
                );
                return;
            }
        }
        if let Err(e) = child.start_kill() {
            log::debug!("[{}] failed to stop process [pid {}]: {}", self.spec.name, pid, e);
        }
    }

    /// Poll until no descendant holds the child's stdio, or shutdown arrives.
    /// Output written by the descendants meanwhile is still relayed.
    async fn wait_for_descendants(
        &mut self,
        inodes: HashSet<u64>,
        pid: u32,
        streams: &mut OutputStreams,
    ) {
        let name = self.spec.name.clone();
        log::info!(
            "[{}] waiting for child processes with parent's stdin/stdout pipes",
            name
        );
        let mut tracker = DescendantTracker::new(inodes);
        let release = tracker.wait_for_release(&name, POLL_INTERVAL);
        tokio::pin!(release);

        let mut commands_open = true;
        let mut stdout_buf = vec![0u8; READ_CHUNK_SIZE];
        let mut stderr_buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => {
                        self.apply_idle(command);
                        if self.shutdown_requested {
                            log::debug!("[{}] shutdown requested, no longer waiting for child processes", name);
                            return;
                        }
                    }
                    None => commands_open = false,
                },
                seen = &mut release => {
                    if seen.is_empty() {
                        log::debug!("[{}] no child processes held the pipes", name);
                    } else {
                        log::info!(
                            "[{}] child processes [{}] have exited",
                            name,
                            descendants::join_pids(&seen)
                        );
                    }
                    self.drain_output(pid, streams, Instant::now() + OUTPUT_DRAIN_GRACE).await;
                    return;
                }
                read = streams.stdout.read_chunk(&mut stdout_buf), if streams.stdout_open => {
                    streams.stdout_open = self.relay_read(OutputStream::Stdout, pid, read, &stdout_buf);
                }
                read = streams.stderr.read_chunk(&mut stderr_buf), if streams.stderr_open => {
                    streams.stderr_open = self.relay_read(OutputStream::Stderr, pid, read, &stderr_buf);
                }
            }
        }
    }

    /// Read what is left on the streams until EOF or `deadline`
    async fn drain_output(&self, pid: u32, streams: &mut OutputStreams, deadline: Instant) {
        let mut stdout_buf = vec![0u8; READ_CHUNK_SIZE];
        let mut stderr_buf = vec![0u8; READ_CHUNK_SIZE];
        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);
        while streams.is_open() {
            tokio::select! {
                read = streams.stdout.read_chunk(&mut stdout_buf), if streams.stdout_open => {
                    streams.stdout_open = self.relay_read(OutputStream::Stdout, pid, read, &stdout_buf);
                }
                read = streams.stderr.read_chunk(&mut stderr_buf), if streams.stderr_open => {
                    streams.stderr_open = self.relay_read(OutputStream::Stderr, pid, read, &stderr_buf);
                }
                _ = &mut expired => break,
            }
        }
    }

    fn finalize(&mut self, outcome: UnitOutcome) {
        for id in self.handlers.drain(..) {
            self.ctx.bus().unsubscribe(id);
        }
        self.set_state(LifecycleState::Cleaned);
        log::debug!("[{}] unit finished: {:?}", self.spec.name, outcome);
        self.done.send_replace(Some(outcome));
    }
}

fn display_code(code: Option<i32>) -> String {
    code.map_or_else(|| "unknown".to_string(), |code| code.to_string())
}

/// Errors that can occur when executing a unit
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Unit '{0}' has already been executed")]
    AlreadyExecuted(String),

    #[error(transparent)]
    Description(#[from] DescriptionError),

    #[error(transparent)]
    OutputConfig(#[from] OutputConfigError),

    #[error("Output of unit '{0}' is not cached")]
    OutputNotCached(String),

    #[error("Invalid value '{value}' for option '{option}'")]
    InvalidOption { option: String, value: String },

    #[error("Failed to resolve option '{option}': {source}")]
    Substitution {
        option: String,
        #[source]
        source: SubstitutionError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_respects_target() {
        let unit = UnitId::next();
        let other = UnitId::next();

        let event = Event::RequestShutdown {
            target: UnitMatcher::Unit(other),
        };
        assert_eq!(route(&event, unit, "talker", false), None);

        let event = Event::RequestShutdown {
            target: UnitMatcher::Name("talker".to_string()),
        };
        assert_eq!(
            route(&event, unit, "talker", false),
            Some(UnitCommand::Shutdown { send_sigint: true })
        );

        let event = Event::StdinData {
            target: UnitMatcher::Any,
            data: b"hi".to_vec(),
        };
        assert_eq!(
            route(&event, unit, "talker", false),
            Some(UnitCommand::Stdin(b"hi".to_vec()))
        );

        let event = Event::RequestSignal {
            signal: ProcessSignal::User1,
            target: UnitMatcher::Unit(unit),
        };
        assert_eq!(
            route(&event, unit, "talker", false),
            Some(UnitCommand::Signal(ProcessSignal::User1))
        );
    }

    #[test]
    fn test_global_shutdown_sigint_rule() {
        let unit = UnitId::next();
        let interrupt = Event::GlobalShutdown {
            due_to_interrupt: true,
        };
        let programmatic = Event::GlobalShutdown {
            due_to_interrupt: false,
        };

        assert_eq!(
            route(&interrupt, unit, "n", false),
            Some(UnitCommand::Shutdown { send_sigint: false })
        );
        assert_eq!(
            route(&interrupt, unit, "n", true),
            Some(UnitCommand::Shutdown { send_sigint: true })
        );
        assert_eq!(
            route(&programmatic, unit, "n", false),
            Some(UnitCommand::Shutdown { send_sigint: true })
        );
    }

    #[test]
    fn test_timeout_resolution_order() {
        let ctx = ExecutionContext::new().with_launch_configuration("sigterm_timeout", "2.5");

        assert_eq!(
            resolve_timeout(&ctx, "sigterm_timeout", Some(Duration::from_secs(1))).unwrap(),
            Duration::from_secs(1)
        );
        assert_eq!(
            resolve_timeout(&ctx, "sigterm_timeout", None).unwrap(),
            Duration::from_millis(2500)
        );
        assert_eq!(
            resolve_timeout(&ctx, "sigkill_timeout", None).unwrap(),
            DEFAULT_ESCALATION_TIMEOUT
        );

        let bad = ExecutionContext::new().with_launch_configuration("sigkill_timeout", "later");
        assert!(matches!(
            resolve_timeout(&bad, "sigkill_timeout", None),
            Err(ProcessError::InvalidOption { .. })
        ));
    }

    #[test]
    fn test_respawn_expression() {
        let ctx = ExecutionContext::new().with_launch_configuration("respawn", "true");
        assert!(resolve_respawn(&ctx, &RespawnSetting::Expr("$(arg respawn)".into())).unwrap());
        assert!(!resolve_respawn(&ctx, &RespawnSetting::Bool(false)).unwrap());

        let ctx = ExecutionContext::new().with_launch_configuration("respawn", "maybe");
        assert!(matches!(
            resolve_respawn(&ctx, &RespawnSetting::Expr("$(arg respawn)".into())),
            Err(ProcessError::InvalidOption { .. })
        ));
        assert!(matches!(
            resolve_respawn(&ExecutionContext::new(), &RespawnSetting::Expr("$(arg nope)".into())),
            Err(ProcessError::Substitution { .. })
        ));
    }

    #[test]
    fn test_cached_output_requires_caching() {
        let unit = ManagedProcess::with_defaults(ProcessDescription::new(["true"]));
        assert!(matches!(unit.stdout(), Err(ProcessError::OutputNotCached(_))));

        let options = ExecuteOptions {
            cached_output: true,
            ..Default::default()
        };
        let unit = ManagedProcess::new(
            ProcessDescription::new(["true"]),
            options,
            Arc::new(StandardLoggers),
        );
        assert_eq!(unit.stdout().unwrap(), "");
        assert_eq!(unit.state(), LifecycleState::NotStarted);
    }

    #[tokio::test]
    async fn test_completion_reports_ready_outcome() {
        let completion = Completion::ready(UnitOutcome::Skipped);
        assert!(completion.is_done());
        assert_eq!(completion.wait().await, UnitOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_dropped_supervisor_is_abandoned() {
        let (tx, rx) = watch::channel(None);
        let completion = Completion { rx };
        drop(tx);
        assert_eq!(completion.wait().await, UnitOutcome::Abandoned);
    }
}
