// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of the forwarder process.
//!
//! The forwarder daemonizes and records its PID in a file. Reloads and stops
//! go through that file rather than the spawned child, so a forwarder started
//! by an earlier controller instance is still reachable.

use crate::error::ProcessLifecycleError;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

pub const PID_FILE: &str = "fluentd.pid";
pub const LOG_FILE: &str = "fluentd.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Stopped,
    Failed,
}

/// Result of a reload request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// SIGHUP was delivered to the forwarder.
    Signalled { pid: i32 },
    /// The PID file holds a non-positive PID; the forwarder has not come up yet.
    NotStarted,
}

/// Controls the forwarder. Implemented by [`ForwarderProcess`] and by test doubles.
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn start(&self) -> Result<(), ProcessLifecycleError>;

    /// Asks the running forwarder to re-read its configuration.
    async fn reload(&self) -> Result<ReloadOutcome, ProcessLifecycleError>;

    async fn stop(&self) -> Result<(), ProcessLifecycleError>;

    fn state(&self) -> ProcessState;
}

/// Program and arguments used to launch the forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ForwarderCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `fluentd -c <config> -p <plugins> -d <pid file> --log <log file>`
    pub fn fluentd(
        program: &str,
        config_file: &Path,
        plugins_dir: &Path,
        pid_file: &Path,
        log_file: &Path,
    ) -> Self {
        let args = vec![
            "-c".to_string(),
            config_file.display().to_string(),
            "-p".to_string(),
            plugins_dir.display().to_string(),
            "-d".to_string(),
            pid_file.display().to_string(),
            "--log".to_string(),
            log_file.display().to_string(),
        ];
        Self::new(program, args)
    }
}

pub struct ForwarderProcess {
    command: ForwarderCommand,
    pid_file: PathBuf,
    start_timeout: Duration,
    state: watch::Sender<ProcessState>,
    child: Mutex<Option<Child>>,
}

impl ForwarderProcess {
    pub fn new(command: ForwarderCommand, pid_file: PathBuf, start_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ProcessState::NotStarted);
        Self {
            command,
            pid_file,
            start_timeout,
            state,
            child: Mutex::new(None),
        }
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ProcessState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("forwarder state {:?} -> {:?}", previous, state);
        }
    }
}

#[async_trait]
impl Supervisor for ForwarderProcess {
    /// Spawns the forwarder and waits up to the start timeout.
    ///
    /// A zero exit within the timeout means the forwarder daemonized; a
    /// non-zero exit is a failed start. A process still alive at the timeout
    /// is considered running.
    async fn start(&self) -> Result<(), ProcessLifecycleError> {
        let mut child_slot = self.child.lock().await;
        let mut started = false;
        self.state.send_if_modified(|state| match state {
            ProcessState::Starting | ProcessState::Running => false,
            _ => {
                *state = ProcessState::Starting;
                started = true;
                true
            }
        });
        if !started {
            return Err(ProcessLifecycleError::AlreadyRunning);
        }

        info!(
            "starting forwarder: {} {}",
            self.command.program,
            self.command.args.join(" ")
        );
        let mut child = match Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.set_state(ProcessState::Failed);
                return Err(ProcessLifecycleError::Spawn(e));
            }
        };

        match tokio::time::timeout(self.start_timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                info!("forwarder daemonized");
                self.set_state(ProcessState::Running);
                Ok(())
            }
            Ok(Ok(status)) => {
                self.set_state(ProcessState::Failed);
                Err(ProcessLifecycleError::StartFailed { status })
            }
            Ok(Err(e)) => {
                self.set_state(ProcessState::Failed);
                Err(ProcessLifecycleError::Spawn(e))
            }
            Err(_) => {
                info!(
                    "forwarder still running after {:?}, considering it started",
                    self.start_timeout
                );
                *child_slot = Some(child);
                self.set_state(ProcessState::Running);
                Ok(())
            }
        }
    }

    async fn reload(&self) -> Result<ReloadOutcome, ProcessLifecycleError> {
        let pid = read_pid(&self.pid_file).await?;
        if pid <= 0 {
            warn!("PID file {} holds pid {pid}, skipping reload", self.pid_file.display());
            return Ok(ReloadOutcome::NotStarted);
        }
        signal(pid, None)?;
        signal(pid, Some(Signal::SIGHUP))?;
        info!("sent SIGHUP to forwarder pid {pid}");
        Ok(ReloadOutcome::Signalled { pid })
    }

    /// Sends SIGTERM to the forwarder. A forwarder that is already gone counts as stopped.
    async fn stop(&self) -> Result<(), ProcessLifecycleError> {
        let result = match read_pid(&self.pid_file).await {
            Ok(pid) if pid > 0 => match signal(pid, Some(Signal::SIGTERM)) {
                Ok(()) => {
                    info!("sent SIGTERM to forwarder pid {pid}");
                    Ok(())
                }
                Err(ProcessLifecycleError::NoSuchProcess(_)) => Ok(()),
                Err(e) => Err(e),
            },
            Ok(_) | Err(ProcessLifecycleError::MissingPid(_)) => Ok(()),
            Err(e) => Err(e),
        };

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.start_kill() {
                debug!("forwarder child already exited: {e}");
            }
            match child.wait().await {
                Ok(status) => debug!("forwarder child reaped with {status}"),
                Err(e) => warn!("failed to reap forwarder child: {e}"),
            }
        }

        if result.is_ok() {
            self.set_state(ProcessState::Stopped);
        }
        result
    }

    fn state(&self) -> ProcessState {
        *self.state.borrow()
    }
}

/// Reads a decimal PID from `path`.
pub async fn read_pid(path: &Path) -> Result<i32, ProcessLifecycleError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ProcessLifecycleError::MissingPid(path.to_path_buf()))
        }
        Err(source) => {
            return Err(ProcessLifecycleError::PidFile {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let trimmed = content.trim();
    trimmed
        .parse::<i32>()
        .map_err(|_| ProcessLifecycleError::InvalidPid {
            path: path.to_path_buf(),
            content: trimmed.to_string(),
        })
}

/// `None` probes for existence without delivering a signal.
fn signal(pid: i32, signal: Option<Signal>) -> Result<(), ProcessLifecycleError> {
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(ProcessLifecycleError::NoSuchProcess(pid)),
        Err(source) => Err(ProcessLifecycleError::Signal { pid, source }),
    }
}
