//! Supervision of a single child process.
//!
//! A [`ProcessSupervisor`] is configured (streams, timeout, kill mode) and
//! then started. Starting spawns one observer task that owns the child and
//! races three events: the child exiting, a cancellation request, and the
//! optional timeout. Whichever resolves first decides the [`Outcome`]; the
//! observer then records completion, releases the stream plumbing and
//! publishes the outcome for every waiter.

use std::ffi::OsStr;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::io::DuplexStream;
#[cfg(unix)]
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
#[cfg(unix)]
use crate::process::streams::merged_output_pipe;
use crate::process::streams::{forward_input, OutputPump, DEFAULT_OUTPUT_BUFFER};
use crate::process::{ExitError, InputStream, Outcome, OutputLines, SupervisorError};

/// Default grace period between SIGTERM and SIGKILL in graceful mode.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long the finalizer waits for output readers to reach end-of-file.
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How a canceled or timed-out process is terminated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KillMode {
    /// Kill immediately (SIGKILL on unix).
    #[default]
    Force,
    /// Send SIGTERM, then kill if the process is still alive after `grace`.
    ///
    /// Falls back to `Force` on non-unix platforms.
    Graceful {
        /// Time allowed between SIGTERM and SIGKILL.
        grace: Duration,
    },
}

/// Completion state shared between the supervisor, its handles and the observer.
#[derive(Debug)]
struct SharedState {
    // Guarded so that `kill` can check and cancel in one step.
    completed: RwLock<bool>,
    cancel: CancellationToken,
    result: watch::Sender<Option<Outcome>>,
}

impl SharedState {
    fn new() -> Self {
        let (result, _) = watch::channel(None);
        Self {
            completed: RwLock::new(false),
            cancel: CancellationToken::new(),
            result,
        }
    }

    fn is_completed(&self) -> bool {
        *self.completed.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_kill(&self) -> bool {
        let completed = self.completed.write().unwrap_or_else(PoisonError::into_inner);
        if *completed {
            return false;
        }
        self.cancel.cancel();
        true
    }

    fn mark_completed(&self) {
        let mut completed = self.completed.write().unwrap_or_else(PoisonError::into_inner);
        *completed = true;
    }

    fn publish(&self, outcome: Outcome) {
        self.result.send_replace(Some(outcome));
    }

    fn try_outcome(&self) -> Option<Outcome> {
        self.result.borrow().clone()
    }

    async fn outcome(&self) -> Outcome {
        let mut rx = self.result.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            // The sender lives in `self`, so this only fails if it was torn down.
            if rx.changed().await.is_err() {
                return Outcome::WaitFailed("result channel closed".to_string());
            }
        }
    }
}

/// Cloneable handle for waiting on and canceling a supervised process.
///
/// Handles can be moved into other tasks while the owner keeps the
/// [`ProcessSupervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    shared: Arc<SharedState>,
}

impl SupervisorHandle {
    /// Request termination of the process.
    ///
    /// Non-blocking. Has an effect only while the process has not completed;
    /// returns whether the request was posted. Calling it again, or after
    /// completion, is a no-op. Termination is observed through [`wait`].
    ///
    /// [`wait`]: Self::wait
    pub fn kill(&self) -> bool {
        let posted = self.shared.request_kill();
        if posted {
            tracing::debug!("Kill requested");
        }
        posted
    }

    /// Wait for the process to finish.
    ///
    /// Every call, from any task, returns the same result.
    ///
    /// # Errors
    ///
    /// Returns an `ExitError` unless the process exited on its own with status zero.
    pub async fn wait(&self) -> Result<(), ExitError> {
        self.shared.outcome().await.into_result()
    }

    /// Wait for the process to finish and return how it ended.
    pub async fn outcome(&self) -> Outcome {
        self.shared.outcome().await
    }

    /// The outcome, if the process has already finished.
    #[must_use]
    pub fn try_outcome(&self) -> Option<Outcome> {
        self.shared.try_outcome()
    }

    /// Whether the process has completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.shared.is_completed()
    }
}

/// Supervisor for a single child process.
#[derive(Debug)]
pub struct ProcessSupervisor {
    program: String,
    command: Command,
    timeout: Option<Duration>,
    kill_mode: KillMode,
    output_buffer: usize,
    started: bool,
    pid: Option<u32>,
    input_stream_set: bool,
    input: Option<DuplexStream>,
    output_stream_set: bool,
    output: Option<mpsc::Sender<String>>,
    handle: SupervisorHandle,
}

impl ProcessSupervisor {
    /// Create a supervisor for `program` with `args`. Nothing is launched yet.
    #[must_use]
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = program.into();
        let mut command = Command::new(&program);
        command.args(args).kill_on_drop(true);

        Self {
            program,
            command,
            timeout: None,
            kill_mode: KillMode::default(),
            output_buffer: DEFAULT_OUTPUT_BUFFER,
            started: false,
            pid: None,
            input_stream_set: false,
            input: None,
            output_stream_set: false,
            output: None,
            handle: SupervisorHandle {
                shared: Arc::new(SharedState::new()),
            },
        }
    }

    /// Create a supervisor with timeout, kill mode, working directory and
    /// environment taken from `config`.
    #[must_use]
    pub fn from_config<I, S>(program: impl Into<String>, args: I, config: &SupervisorConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut supervisor = Self::new(program, args);
        supervisor.timeout = config.timeout();
        supervisor.kill_mode = config.kill_mode();
        supervisor.output_buffer = config.output_buffer.max(1);
        if let Some(dir) = &config.working_dir {
            supervisor.command.current_dir(dir);
        }
        supervisor.command.envs(&config.env);
        supervisor
    }

    fn ensure_not_started(&self) -> Result<(), SupervisorError> {
        if self.started {
            return Err(SupervisorError::AlreadyStarted);
        }
        Ok(())
    }

    /// Point stdout and stderr at one shared pipe when output is captured.
    ///
    /// Both streams then reach the reader in the order the child wrote them.
    #[cfg(unix)]
    fn wire_output(&mut self) -> io::Result<Option<pipe::Receiver>> {
        if self.output.is_none() {
            self.command.stdout(Stdio::null()).stderr(Stdio::null());
            return Ok(None);
        }
        let (reader, stdout, stderr) = merged_output_pipe()?;
        self.command.stdout(stdout).stderr(stderr);
        Ok(Some(reader))
    }

    /// Without a shared pipe, stdout and stderr are read from the child separately.
    #[cfg(not(unix))]
    fn wire_output(&mut self) -> io::Result<Option<tokio::process::ChildStdout>> {
        let stdio = || {
            if self.output.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            }
        };
        let (stdout, stderr) = (stdio(), stdio());
        self.command.stdout(stdout).stderr(stderr);
        Ok(None)
    }

    /// Record a launch failure so waiters are released, and classify it.
    fn launch_failed(&mut self, e: io::Error) -> SupervisorError {
        let err = SupervisorError::from_spawn(&self.program, e);
        tracing::warn!(program = %self.program, error = %err, "Failed to launch process");
        let shared = &self.handle.shared;
        shared.mark_completed();
        // Dropping these ends the caller's output stream and fails its input writes.
        self.input = None;
        self.output = None;
        shared.publish(Outcome::LaunchFailed(err.to_string()));
        err
    }

    /// Terminate the process if it is still running after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::AlreadyStarted` once the process has started.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<&mut Self, SupervisorError> {
        self.ensure_not_started()?;
        self.timeout = Some(timeout);
        Ok(self)
    }

    /// Choose how the process is terminated on cancellation or timeout.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::AlreadyStarted` once the process has started.
    pub fn set_kill_mode(&mut self, mode: KillMode) -> Result<&mut Self, SupervisorError> {
        self.ensure_not_started()?;
        self.kill_mode = mode;
        Ok(self)
    }

    /// Set the working directory of the child.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::AlreadyStarted` once the process has started.
    pub fn set_working_dir(
        &mut self,
        dir: impl Into<PathBuf>,
    ) -> Result<&mut Self, SupervisorError> {
        self.ensure_not_started()?;
        self.command.current_dir(dir.into());
        Ok(self)
    }

    /// Add an environment variable for the child.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::AlreadyStarted` once the process has started.
    pub fn env(
        &mut self,
        key: impl AsRef<OsStr>,
        value: impl AsRef<OsStr>,
    ) -> Result<&mut Self, SupervisorError> {
        self.ensure_not_started()?;
        self.command.env(key, value);
        Ok(self)
    }

    /// Open a writable stream connected to the child's stdin.
    ///
    /// Can be called at most once, and only before [`start`](Self::start).
    /// Without it the child's stdin is empty.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::InputStreamAlreadySet` on a second call and
    /// `SupervisorError::AlreadyStarted` after start.
    pub fn open_input_stream(&mut self) -> Result<InputStream, SupervisorError> {
        if self.input_stream_set {
            return Err(SupervisorError::InputStreamAlreadySet);
        }
        self.ensure_not_started()?;

        let (stream, source) = InputStream::pair();
        self.input = Some(source);
        self.input_stream_set = true;
        Ok(stream)
    }

    /// Capture stdout and stderr of the child as one stream of lines.
    ///
    /// Can be called at most once, and only before [`start`](Self::start).
    /// Output of a process started without it is discarded.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::AlreadyStarted` after start and
    /// `SupervisorError::OutputStreamAlreadySet` on a second call.
    pub fn stream_output(&mut self) -> Result<OutputLines, SupervisorError> {
        self.ensure_not_started()?;
        if self.output_stream_set {
            return Err(SupervisorError::OutputStreamAlreadySet);
        }

        let (tx, lines) = OutputLines::channel(self.output_buffer);
        self.output = Some(tx);
        self.output_stream_set = true;
        Ok(lines)
    }

    /// Launch the process and begin supervising it. Returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::AlreadyStarted` on a second call, or a
    /// launch error if the process cannot be spawned. A launch failure is
    /// also published as `Outcome::LaunchFailed` to any waiter.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(&mut self) -> Result<&mut Self, SupervisorError> {
        self.ensure_not_started()?;
        self.started = true;

        let stdin = if self.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        self.command.stdin(stdin);

        let merged = match self.wire_output() {
            Ok(merged) => merged,
            Err(e) => return Err(self.launch_failed(e)),
        };
        let spawned = self.command.spawn();
        // The command keeps its stdio; drop our copies of the pipe's write end so EOF can arrive.
        self.command.stdout(Stdio::null()).stderr(Stdio::null());
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => return Err(self.launch_failed(e)),
        };

        self.pid = child.id();
        tracing::info!(
            program = %self.program,
            pid = ?self.pid,
            timeout = ?self.timeout,
            "Process started"
        );

        let input_task = match (self.input.take(), child.stdin.take()) {
            (Some(source), Some(stdin)) => Some(tokio::spawn(forward_input(source, stdin))),
            _ => None,
        };

        let output = self.output.take().map(|tx| {
            let mut pump = OutputPump::new(tx);
            if let Some(reader) = merged {
                pump.attach(reader, "output");
            }
            if let Some(stdout) = child.stdout.take() {
                pump.attach(stdout, "stdout");
            }
            if let Some(stderr) = child.stderr.take() {
                pump.attach(stderr, "stderr");
            }
            pump
        });

        let observer = Observer {
            child,
            pid: self.pid,
            shared: Arc::clone(&self.handle.shared),
            timeout: self.timeout,
            kill_mode: self.kill_mode,
            input_task,
            output,
        };
        tokio::spawn(observer.run());

        Ok(self)
    }

    /// Request termination of the process. See [`SupervisorHandle::kill`].
    pub fn kill(&self) -> bool {
        self.handle.kill()
    }

    /// Wait for the process to finish. See [`SupervisorHandle::wait`].
    ///
    /// # Errors
    ///
    /// Returns an `ExitError` unless the process exited on its own with status zero.
    pub async fn wait(&self) -> Result<(), ExitError> {
        self.handle.wait().await
    }

    /// Wait for the process to finish and return how it ended.
    pub async fn outcome(&self) -> Outcome {
        self.handle.outcome().await
    }

    /// The outcome, if the process has already finished.
    #[must_use]
    pub fn try_outcome(&self) -> Option<Outcome> {
        self.handle.try_outcome()
    }

    /// A cloneable handle for waiting and killing from other tasks.
    #[must_use]
    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    /// Whether [`start`](Self::start) has been called.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Whether the process has completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.handle.is_completed()
    }

    /// OS process id, once started.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// The program this supervisor runs.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// The configured timeout, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The configured kill mode.
    #[must_use]
    pub fn kill_mode(&self) -> KillMode {
        self.kill_mode
    }
}

/// Owns the child after start and resolves its outcome.
struct Observer {
    child: Child,
    pid: Option<u32>,
    shared: Arc<SharedState>,
    timeout: Option<Duration>,
    kill_mode: KillMode,
    input_task: Option<JoinHandle<()>>,
    output: Option<OutputPump>,
}

impl Observer {
    async fn run(mut self) {
        let outcome = self.race().await;
        self.finalize(outcome).await;
    }

    /// Exactly one of exit, cancellation or timeout resolves; exit wins ties.
    async fn race(&mut self) -> Outcome {
        let cancel = self.shared.cancel.clone();
        let limit = self.timeout;

        tokio::select! {
            biased;

            status = self.child.wait() => {
                let outcome = Outcome::from_wait(status);
                tracing::debug!(pid = ?self.pid, %outcome, "Process exited");
                outcome
            }
            () = cancel.cancelled() => {
                tracing::info!(pid = ?self.pid, "Cancellation requested, terminating process");
                self.terminate().await;
                Outcome::Canceled
            }
            () = sleep_or_pending(limit) => {
                tracing::info!(pid = ?self.pid, timeout = ?limit, "Timeout elapsed, terminating process");
                self.terminate().await;
                Outcome::TimedOut
            }
        }
    }

    async fn terminate(&mut self) {
        let result = match self.kill_mode {
            KillMode::Force => self.child.kill().await,
            KillMode::Graceful { grace } => graceful_terminate(&mut self.child, grace).await,
        };
        if let Err(e) = result {
            tracing::warn!(pid = ?self.pid, error = %e, "Failed to terminate process");
        }
    }

    /// Runs once: record completion, release streams, publish the outcome.
    async fn finalize(self, outcome: Outcome) {
        self.shared.mark_completed();

        if let Some(task) = self.input_task {
            task.abort();
            // Join so the caller's `InputStream` is disconnected before the outcome is visible.
            let _ = task.await;
        }
        if let Some(output) = self.output {
            output.close(OUTPUT_DRAIN_TIMEOUT).await;
        }

        tracing::info!(pid = ?self.pid, %outcome, "Process finished");
        self.shared.publish(outcome);
    }
}

async fn sleep_or_pending(limit: Option<Duration>) {
    match limit {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Send SIGTERM, then SIGKILL if the child outlives `grace`.
#[cfg(unix)]
async fn graceful_terminate(child: &mut Child, grace: Duration) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};

    let Some(pid) = child.id() else {
        // Already reaped.
        return Ok(());
    };

    let Some(nix_pid) = signal_target(pid) else {
        tracing::debug!(pid, "Pid does not fit a signal target, killing process");
        return child.kill().await;
    };
    if let Err(e) = kill(nix_pid, Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "Failed to send SIGTERM");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            tracing::debug!(pid, ?grace, "Grace period elapsed, killing process");
            child.kill().await
        }
    }
}

#[cfg(unix)]
fn signal_target(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid).ok().map(nix::unistd::Pid::from_raw)
}

#[cfg(not(unix))]
async fn graceful_terminate(child: &mut Child, grace: Duration) -> io::Result<()> {
    let _ = grace;
    child.kill().await
}
