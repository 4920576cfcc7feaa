use crate::context::BridgeContext;
use crate::environment::derive_environment;
use crate::handler::WorkerRequest;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// How long leftover output is read after the worker has exited
const PIPE_DRAIN_WINDOW: Duration = Duration::from_millis(200);

/// Lifecycle of a worker invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    /// Created, no spawn attempted yet
    NotStarted,
    /// Process is running and its output is being drained
    Running,
    /// Process exited on its own
    Completed,
    /// No candidate executable could be launched
    FailedToStart,
    /// Process was terminated at the deadline
    TimedOut,
    /// Process was terminated because the client went away
    Canceled,
    /// Waiting on the process failed; it was terminated without completing
    WaitFailed,
}

impl InvocationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvocationState::NotStarted | InvocationState::Running)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("no executable candidates configured")]
    NoCandidates,

    #[error("failed to start '{candidate}' after {attempts} attempt(s): {source}")]
    Spawn {
        /// Last candidate tried
        candidate: String,
        attempts: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("worker already started")]
    AlreadyStarted,
}

#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error(transparent)]
    Start(#[from] StartError),

    #[error("worker is not running")]
    NotRunning,

    #[error("worker {0} was not captured")]
    MissingPipe(&'static str),

    #[error("failed to wait for worker: {0}")]
    Wait(#[source] std::io::Error),
}

/// Output accumulated from the worker's two streams
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CapturedOutput {
    pub fn stdout_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// How a running worker reached its terminal state
#[derive(Debug)]
pub enum WorkerOutcome {
    /// Worker exited by itself; output is complete
    Completed {
        status: ExitStatus,
        output: CapturedOutput,
    },
    /// Deadline passed; worker was terminated and its output discarded
    TimedOut { after: Duration },
    /// Client disconnected; worker was terminated
    Canceled,
}

enum Finished {
    Exited(std::io::Result<ExitStatus>),
    Deadline,
    Disconnected,
}

/// One worker process serving one request.
///
/// Owns the child handle, the derived environment and the output buffers.
/// Dropping a running invocation terminates the worker.
pub struct WorkerInvocation {
    request_id: String,
    candidates: Vec<String>,
    args: Vec<String>,
    working_dir: PathBuf,
    env: BTreeMap<String, String>,
    timeout: Duration,
    shutdown_grace_period: Duration,
    state: InvocationState,
    child: Option<Child>,
    pid: Option<u32>,
    executable: Option<String>,
    started_at: Option<Instant>,
}

impl WorkerInvocation {
    pub fn new(context: &BridgeContext, request: &WorkerRequest) -> Self {
        let settings = context.worker();
        Self {
            request_id: request.request_id.clone(),
            candidates: settings.candidates.clone(),
            args: settings.args.clone(),
            working_dir: settings.working_dir.clone(),
            env: derive_environment(context.base_env(), settings, request),
            timeout: settings.timeout,
            shutdown_grace_period: settings.shutdown_grace_period,
            state: InvocationState::NotStarted,
            child: None,
            pid: None,
            executable: None,
            started_at: None,
        }
    }

    pub fn state(&self) -> InvocationState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The candidate that was launched
    pub fn executable(&self) -> Option<&str> {
        self.executable.as_deref()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Launch the worker, trying each candidate in order.
    ///
    /// The first candidate that spawns is used. Each candidate is tried once.
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.state != InvocationState::NotStarted {
            return Err(StartError::AlreadyStarted);
        }

        let mut last_error: Option<(String, std::io::Error)> = None;

        for (attempt, candidate) in self.candidates.iter().enumerate() {
            debug!(
                request_id = %self.request_id,
                candidate = %candidate,
                attempt = attempt + 1,
                working_dir = %self.working_dir.display(),
                "Spawning worker"
            );

            let mut cmd = Command::new(candidate);
            cmd.args(&self.args);
            cmd.current_dir(&self.working_dir);
            cmd.env_clear();
            cmd.envs(&self.env);
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
            cmd.kill_on_drop(true);
            // The worker leads its own group so descendants are signalled with it
            #[cfg(unix)]
            cmd.process_group(0);

            match cmd.spawn() {
                Ok(child) => {
                    let pid = child.id();
                    info!(
                        request_id = %self.request_id,
                        candidate = %candidate,
                        pid = pid.unwrap_or(0),
                        "Worker process spawned"
                    );
                    self.pid = pid;
                    self.executable = Some(candidate.clone());
                    self.child = Some(child);
                    self.started_at = Some(Instant::now());
                    self.state = InvocationState::Running;
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        request_id = %self.request_id,
                        candidate = %candidate,
                        error = %e,
                        "Failed to start worker candidate"
                    );
                    last_error = Some((candidate.clone(), e));
                }
            }
        }

        self.state = InvocationState::FailedToStart;
        match last_error {
            Some((candidate, source)) => Err(StartError::Spawn {
                candidate,
                attempts: self.candidates.len(),
                source,
            }),
            None => Err(StartError::NoCandidates),
        }
    }

    /// Drain the worker's output until it exits, the deadline passes, or
    /// `disconnected` resolves, whichever comes first.
    ///
    /// The worker's own exit ends the wait even if a descendant keeps its
    /// pipes open. The losing watchers are dropped with the select, so the
    /// timer never outlives the flow and the worker is signalled at most once.
    pub async fn wait<C>(&mut self, disconnected: C) -> Result<WorkerOutcome, InvocationError>
    where
        C: Future<Output = ()>,
    {
        if self.state != InvocationState::Running {
            return Err(InvocationError::NotRunning);
        }

        let started_at = self.started_at.unwrap_or_else(Instant::now);
        let deadline = tokio::time::Instant::from_std(started_at + self.timeout);
        let request_id = self.request_id.clone();

        let child = self.child.as_mut().ok_or(InvocationError::NotRunning)?;
        let mut stdout = child.stdout.take().ok_or(InvocationError::MissingPipe("stdout"))?;
        let mut stderr = child.stderr.take().ok_or(InvocationError::MissingPipe("stderr"))?;

        let mut output = CapturedOutput::default();
        let pipes_open;
        let finished = {
            let stdout_buf = &mut output.stdout;
            let stderr_buf = &mut output.stderr;

            // Both streams are drained together so a full pipe on one side
            // can never stall the other.
            let drain = async {
                let (stdout_result, stderr_result) = tokio::join!(
                    stdout.read_to_end(stdout_buf),
                    stderr.read_to_end(stderr_buf)
                );
                if let Err(e) = stdout_result {
                    warn!(request_id = %request_id, error = %e, "Error reading worker stdout");
                }
                if let Err(e) = stderr_result {
                    warn!(request_id = %request_id, error = %e, "Error reading worker stderr");
                }
            };
            tokio::pin!(drain);
            tokio::pin!(disconnected);
            let deadline = tokio::time::sleep_until(deadline);
            tokio::pin!(deadline);

            let mut drained = false;
            let finished = loop {
                tokio::select! {
                    biased;
                    status = child.wait() => break Finished::Exited(status),
                    _ = &mut drain, if !drained => drained = true,
                    _ = &mut disconnected => break Finished::Disconnected,
                    _ = &mut deadline => break Finished::Deadline,
                }
            };

            // Exit is the terminal event. Descendants may still hold the
            // pipes open, so the remaining output is only read for a short
            // window instead of waiting for EOF.
            pipes_open = matches!(finished, Finished::Exited(Ok(_)))
                && !drained
                && tokio::time::timeout(PIPE_DRAIN_WINDOW, &mut drain).await.is_err();
            finished
        };

        let elapsed_ms = started_at.elapsed().as_millis() as u64;

        match finished {
            Finished::Exited(Ok(status)) => {
                self.state = InvocationState::Completed;
                self.child = None;
                if pipes_open {
                    warn!(
                        request_id = %self.request_id,
                        pid = self.pid.unwrap_or(0),
                        "Worker exited but descendants still hold its output, terminating them"
                    );
                    #[cfg(unix)]
                    if let Some(pid) = self.pid {
                        signal_group(pid, libc::SIGTERM);
                    }
                }
                info!(
                    request_id = %self.request_id,
                    pid = self.pid.unwrap_or(0),
                    exit_code = ?status.code(),
                    elapsed_ms,
                    stdout_bytes = output.stdout.len(),
                    stderr_bytes = output.stderr.len(),
                    "Worker exited"
                );
                debug!(request_id = %self.request_id, stdout = %output.stdout_text(), "Worker stdout");
                debug!(request_id = %self.request_id, stderr = %output.stderr_text(), "Worker stderr");
                Ok(WorkerOutcome::Completed { status, output })
            }
            Finished::Exited(Err(e)) => {
                error!(request_id = %self.request_id, error = %e, "Failed to wait for worker");
                self.terminate(InvocationState::WaitFailed);
                Err(InvocationError::Wait(e))
            }
            Finished::Deadline => {
                warn!(
                    request_id = %self.request_id,
                    pid = self.pid.unwrap_or(0),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Worker timed out, terminating"
                );
                debug!(
                    request_id = %self.request_id,
                    stdout = %output.stdout_text(),
                    stderr = %output.stderr_text(),
                    "Discarding partial worker output"
                );
                self.terminate(InvocationState::TimedOut);
                Ok(WorkerOutcome::TimedOut { after: self.timeout })
            }
            Finished::Disconnected => {
                info!(
                    request_id = %self.request_id,
                    pid = self.pid.unwrap_or(0),
                    elapsed_ms,
                    "Client disconnected, terminating worker"
                );
                self.terminate(InvocationState::Canceled);
                Ok(WorkerOutcome::Canceled)
            }
        }
    }

    /// Terminate the worker on behalf of a departed client.
    ///
    /// Returns true if a signal was sent. No-op once the invocation is terminal.
    pub fn cancel(&mut self) -> bool {
        self.terminate(InvocationState::Canceled)
    }

    fn terminate(&mut self, next: InvocationState) -> bool {
        if self.state.is_terminal() {
            debug!(request_id = %self.request_id, state = ?self.state, "Worker already finished, ignoring termination");
            return false;
        }
        self.state = next;

        let Some(mut child) = self.child.take() else {
            return false;
        };

        if let Some(pid) = child.id() {
            info!(request_id = %self.request_id, pid, "Sending SIGTERM to worker");
            send_terminate(&mut child);
        }

        spawn_reaper(child, self.request_id.clone(), self.shutdown_grace_period);
        true
    }
}

impl Drop for WorkerInvocation {
    fn drop(&mut self) {
        if self.child.is_some() && !self.state.is_terminal() {
            self.terminate(InvocationState::Canceled);
        }
    }
}

/// SIGTERM to the worker's process group on Unix so the worker and its
/// descendants can clean up, a hard kill elsewhere
fn send_terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            if !signal_group(pid, libc::SIGTERM) {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
}

/// Signal every process in the group led by `pid`
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    unsafe { libc::killpg(pid as libc::pid_t, signal) == 0 }
}

/// Wait for a signalled worker in the background, escalating to SIGKILL
/// after the grace period. The response path never waits on this.
fn spawn_reaper(mut child: Child, request_id: String, grace_period: Duration) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        let _ = child.start_kill();
        return;
    };

    runtime.spawn(async move {
        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(request_id = %request_id, ?status, "Terminated worker reaped");
            }
            Ok(Err(e)) => {
                warn!(request_id = %request_id, error = %e, "Error waiting for terminated worker");
            }
            Err(_) => {
                warn!(
                    request_id = %request_id,
                    grace_period_ms = grace_period.as_millis() as u64,
                    "Grace period exceeded, sending SIGKILL"
                );
                #[cfg(unix)]
                if let Some(pid) = child.id() {
                    signal_group(pid, libc::SIGKILL);
                }
                let _ = child.kill().await;
            }
        }
    });
}
