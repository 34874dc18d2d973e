//! External process supervision.
//!
//! Each spawned process gets a waiter task that owns the `Child`, reaps it,
//! and publishes the exit through a watch channel. Output is forwarded as raw
//! byte chunks as soon as it is read.
//!
//! ## Termination
//!
//! ```text
//! kill() -> SIGTERM -> wait stop_timeout -> SIGKILL -> wait stop_timeout -> give up
//! ```

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use trawl_core::TrawlConfig;

use crate::error::{SupervisorError, SupervisorResult};

/// Which pipe a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    fn from_status(pid: u32, status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            pid,
            code: status.code(),
            signal,
        }
    }

    fn unknown(pid: u32) -> Self {
        Self {
            pid,
            code: None,
            signal: None,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {}", code),
            (None, Some(signal)) => write!(f, "terminated by signal {}", signal),
            (None, None) => write!(f, "exited with unknown status"),
        }
    }
}

/// Receives output chunks.
pub type OutputHandler = Arc<dyn Fn(OutputStream, &[u8]) + Send + Sync>;

/// Receives the exit of a process. Called exactly once.
pub type ExitHandler = Box<dyn FnOnce(ProcessExit) + Send>;

/// Program, arguments and environment overrides of a process to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl SpawnSpec {
    /// Creates a spec for `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds an environment override on top of the inherited environment.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// Handle to a supervised process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    exit: watch::Receiver<Option<ProcessExit>>,
    force_kill: mpsc::UnboundedSender<()>,
}

impl ProcessHandle {
    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns the exit if the process has already been reaped.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Waits for the process to exit.
    pub async fn wait(&self) -> ProcessExit {
        let mut exit = self.exit.clone();
        let observed = match exit.wait_for(Option::is_some).await {
            Ok(value) => *value,
            Err(_) => None,
        };
        observed.unwrap_or_else(|| ProcessExit::unknown(self.pid))
    }

    fn request_force_kill(&self) {
        let _ = self.force_kill.send(());
    }
}

/// Spawns, watches and terminates external processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    start_timeout: Duration,
    stop_timeout: Duration,
    tracked: Arc<Mutex<HashMap<u32, ProcessHandle>>>,
}

impl ProcessSupervisor {
    /// Creates a supervisor.
    ///
    /// `start_timeout` is the grace period during which an exit counts as a
    /// failed launch. `stop_timeout` bounds each wait in [`Self::kill`].
    pub fn new(start_timeout: Duration, stop_timeout: Duration) -> Self {
        Self {
            start_timeout,
            stop_timeout,
            tracked: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Creates a supervisor with the configured timeouts.
    pub fn from_config(config: &TrawlConfig) -> Self {
        Self::new(config.start_timeout, config.stop_timeout)
    }

    /// Launches a process.
    ///
    /// Fails if the OS refuses to create it, or if it exits before the start
    /// grace period has elapsed. `on_exit` fires in both the failure and the
    /// normal case.
    pub async fn spawn(
        &self,
        spec: &SpawnSpec,
        on_output: OutputHandler,
        on_exit: ExitHandler,
    ) -> SupervisorResult<ProcessHandle> {
        let program = spec.program.display().to_string();

        let mut child = spec
            .command()
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: program.clone(),
                source,
            })?;
        let pid = child.id().ok_or_else(|| SupervisorError::NoPid {
            program: program.clone(),
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, OutputStream::Stdout, Arc::clone(&on_output)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, OutputStream::Stderr, Arc::clone(&on_output)));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel();
        let handle = ProcessHandle {
            pid,
            exit: exit_rx,
            force_kill: kill_tx,
        };
        self.tracked.lock().insert(pid, handle.clone());

        let tracked = Arc::clone(&self.tracked);
        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(()) = kill_rx.recv() => {
                        if let Err(e) = child.start_kill() {
                            debug!(pid, error = %e, "Force kill failed");
                        }
                    }
                }
            };

            let exit = match status {
                Ok(status) => ProcessExit::from_status(pid, status),
                Err(e) => {
                    warn!(pid, error = %e, "Failed to wait on process");
                    ProcessExit::unknown(pid)
                }
            };
            tracked.lock().remove(&pid);
            debug!(pid, %exit, "Process exited");

            exit_tx.send_replace(Some(exit));
            on_exit(exit);
        });

        if let Ok(exit) = tokio::time::timeout(self.start_timeout, handle.wait()).await {
            return Err(SupervisorError::ExitedEarly { program, exit });
        }

        info!(pid, program = %program, "Spawned process");
        Ok(handle)
    }

    /// Terminates a process, escalating to a forced kill after the stop timeout.
    ///
    /// Always returns; if the process survives even the forced kill, the exit
    /// is reported with no code and no signal.
    pub async fn kill(&self, handle: &ProcessHandle) -> ProcessExit {
        if let Some(exit) = handle.exit_status() {
            return exit;
        }
        let pid = handle.pid();

        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM failed");
            }
            if let Ok(exit) = tokio::time::timeout(self.stop_timeout, handle.wait()).await {
                return exit;
            }
            warn!(
                pid,
                timeout_ms = self.stop_timeout.as_millis() as u64,
                "Process did not exit after SIGTERM, killing"
            );
        }

        handle.request_force_kill();
        match tokio::time::timeout(self.stop_timeout, handle.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(pid, "Process did not exit after forced kill");
                ProcessExit::unknown(pid)
            }
        }
    }

    /// Liveness probe that does not affect the process.
    pub fn is_running(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            use nix::sys::signal;
            use nix::unistd::Pid;

            signal::kill(Pid::from_raw(pid as i32), None).is_ok()
        }
        #[cfg(not(unix))]
        {
            self.tracked.lock().contains_key(&pid)
        }
    }

    /// Pids of processes that have not been reaped yet.
    pub fn tracked_pids(&self) -> Vec<u32> {
        self.tracked.lock().keys().copied().collect()
    }

    /// Kills every tracked process.
    pub async fn kill_all(&self) {
        let handles: Vec<ProcessHandle> = self.tracked.lock().values().cloned().collect();
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "Killing remaining processes");
        for handle in handles {
            let exit = self.kill(&handle).await;
            debug!(pid = handle.pid(), %exit, "Killed process");
        }
    }
}

async fn pump<R>(mut reader: R, stream: OutputStream, on_output: OutputHandler)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => on_output(stream, &buf[..n]),
            Err(e) => {
                debug!(?stream, error = %e, "Output pipe closed");
                break;
            }
        }
    }
}
