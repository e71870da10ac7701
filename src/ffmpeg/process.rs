//! Spawning and stopping the external ffmpeg / ffplay processes.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::FfmpegCommand;
use crate::error::{Result, StreamError};

/// How a process ended after [`ManagedProcess::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Already gone, or exited within the grace period
    Exited(Option<i32>),
    /// Had to be killed
    Killed,
}

/// Stderr line classes worth surfacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrClass {
    Problem,
    StreamInfo,
    Chatter,
}

pub fn classify_stderr(line: &str) -> StderrClass {
    let lower = line.to_ascii_lowercase();
    if ["error", "fail", "fatal", "invalid"].iter().any(|k| lower.contains(k)) {
        StderrClass::Problem
    } else if line.contains("Input #0") || line.contains("Stream mapping") || line.contains("Stream #0") {
        StderrClass::StreamInfo
    } else {
        StderrClass::Chatter
    }
}

/// A child process with its stderr drained into the log.
pub struct ManagedProcess {
    name: String,
    child: Child,
    stderr_task: Option<JoinHandle<()>>,
}

impl ManagedProcess {
    /// Spawn `command`. `name` labels its log lines (`capture`, `encoder`, ...).
    pub fn spawn(name: &str, command: &FfmpegCommand, stdin: Stdio, stdout: Stdio) -> Result<Self> {
        debug!("Starting {}: {}", name, command);
        let mut child = command
            .to_command(stdin, stdout)
            .spawn()
            .map_err(|e| StreamError::spawn_failed(command.program(), e))?;

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(monitor_stderr(name.to_string(), stderr)));

        info!("✅ {} started (pid {})", name, child.id().unwrap_or(0));
        Ok(Self { name: name.to_string(), child, stderr_task })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdin(&mut self) -> Result<ChildStdin> {
        self.child
            .stdin
            .take()
            .ok_or_else(|| StreamError::PipeUnavailable { program: self.name.clone(), pipe: "stdin" })
    }

    pub fn take_stdout(&mut self) -> Result<ChildStdout> {
        self.child
            .stdout
            .take()
            .ok_or_else(|| StreamError::PipeUnavailable { program: self.name.clone(), pipe: "stdout" })
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        self.child
            .try_wait()
            .map_err(|e| StreamError::frame_io(format!("polling {}", self.name), e))
    }

    /// Wait for the process to exit on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child
            .wait()
            .await
            .map_err(|e| StreamError::frame_io(format!("waiting for {}", self.name), e))
    }

    /// Error describing an unexpected exit.
    pub fn exited_error(&self, status: ExitStatus) -> StreamError {
        StreamError::ProcessExited { program: self.name.clone(), status: status.to_string() }
    }

    /// Close stdin, ask the process to terminate, then kill it once `grace`
    /// runs out.
    pub async fn stop(mut self, grace: Duration) -> StopOutcome {
        // ffmpeg finalizes its output when stdin closes
        drop(self.child.stdin.take());

        if let Ok(Some(status)) = self.child.try_wait() {
            self.finish_stderr().await;
            return StopOutcome::Exited(status.code());
        }

        self.terminate();

        let outcome = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("{} exited with {}", self.name, status);
                StopOutcome::Exited(status.code())
            }
            Ok(Err(e)) => {
                warn!("Failed to wait for {}: {}", self.name, e);
                self.kill().await
            }
            Err(_) => {
                warn!("{} did not exit within {:?}, killing it", self.name, grace);
                self.kill().await
            }
        };
        self.finish_stderr().await;
        outcome
    }

    #[cfg(unix)]
    fn terminate(&self) {
        if let Some(pid) = self.child.id() {
            // SAFETY: plain kill(2) on a pid we spawned and have not reaped
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                debug!("SIGTERM to {} failed: {}", self.name, std::io::Error::last_os_error());
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {}

    async fn kill(&mut self) -> StopOutcome {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill {}: {}", self.name, e);
        }
        StopOutcome::Killed
    }

    async fn finish_stderr(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            if tokio::time::timeout(Duration::from_millis(500), task).await.is_err() {
                debug!("{} stderr monitor still busy, detaching", self.name);
            }
        }
    }
}

async fn monitor_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match classify_stderr(&line) {
                StderrClass::Problem => warn!("{}: {}", name, line),
                StderrClass::StreamInfo => info!("{}: {}", name, line),
                StderrClass::Chatter => trace!("{}: {}", name, line),
            },
            Ok(None) => break,
            Err(e) => {
                debug!("{} stderr closed: {}", name, e);
                break;
            }
        }
    }
}
