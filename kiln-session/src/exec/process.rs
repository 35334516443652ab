//! Subprocess plumbing for model invocations.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A command line plus the text fed to its stdin.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            cwd: None,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn cwd(mut self, dir: Option<PathBuf>) -> Self {
        self.cwd = dir;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessOutput {
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("executable not found: {0}")]
    NotFound(String),

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("process timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),

    #[error("process cancelled")]
    Cancelled,
}

/// Starts subprocesses. Swapped for a fake in tests.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start a long-lived process.
    async fn spawn(&self, invocation: &Invocation) -> Result<Box<dyn ProcessHandle>, ProcessError>;

    /// Run to completion within `timeout`. On expiry or cancellation the
    /// process is sent a terminate signal, then killed once `kill_grace` has
    /// passed.
    async fn run(
        &self,
        invocation: &Invocation,
        timeout: Duration,
        kill_grace: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError> {
        let mut handle = self.spawn(invocation).await?;
        let reason = tokio::select! {
            waited = tokio::time::timeout(timeout, handle.wait()) => match waited {
                Ok(result) => return result,
                Err(_) => ProcessError::TimedOut(timeout),
            },
            _ = cancel.cancelled() => ProcessError::Cancelled,
        };
        warn!(program = %invocation.program, reason = %reason, "terminating process");
        handle.terminate(kill_grace).await;
        Err(reason)
    }
}

/// A running process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Stream of stdout lines as they are produced. Only the first call returns a receiver.
    fn stdout_lines(&mut self) -> Option<mpsc::UnboundedReceiver<String>>;

    /// Wait for exit and collect the output. Safe to call again after being cancelled.
    async fn wait(&mut self) -> Result<ProcessOutput, ProcessError>;

    /// SIGTERM, then SIGKILL if still alive after `grace`.
    async fn terminate(&mut self, grace: Duration);
}

/// Launcher backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn spawn(&self, invocation: &Invocation) -> Result<Box<dyn ProcessHandle>, ProcessError> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| classify_spawn_error(&invocation.program, e))?;
        debug!(program = %invocation.program, pid = ?child.id(), "spawned process");

        if let (Some(input), Some(mut stdin)) = (invocation.stdin.clone(), child.stdin.take()) {
            // Feed stdin from its own task so a large prompt cannot deadlock against a full stdout pipe.
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!(error = %e, "failed to write process stdin");
                }
            });
        }

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let stdout_task = child.stdout.take().map(|out| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                let mut collected = String::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    collected.push_str(&line);
                    collected.push('\n');
                    let _ = line_tx.send(line);
                }
                collected
            })
        });
        let stderr_task = child.stderr.take().map(|err| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                let mut collected = String::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    collected.push_str(&line);
                    collected.push('\n');
                }
                collected
            })
        });

        Ok(Box::new(TokioHandle {
            child,
            line_rx: Some(line_rx),
            stdout_task,
            stderr_task,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            exited: false,
        }))
    }
}

fn classify_spawn_error(program: &str, e: std::io::Error) -> ProcessError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ProcessError::NotFound(program.to_string())
    } else {
        ProcessError::Spawn {
            program: program.to_string(),
            source: e,
        }
    }
}

struct TokioHandle {
    child: Child,
    line_rx: Option<mpsc::UnboundedReceiver<String>>,
    stdout_task: Option<JoinHandle<String>>,
    stderr_task: Option<JoinHandle<String>>,
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    exited: bool,
}

#[async_trait]
impl ProcessHandle for TokioHandle {
    fn stdout_lines(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.line_rx.take()
    }

    async fn wait(&mut self) -> Result<ProcessOutput, ProcessError> {
        if !self.exited {
            let status = self.child.wait().await?;
            self.exit_code = status.code();
            self.exited = true;
        }
        if let Some(task) = &mut self.stdout_task {
            self.stdout = task.await.unwrap_or_default();
            self.stdout_task = None;
        }
        if let Some(task) = &mut self.stderr_task {
            self.stderr = task.await.unwrap_or_default();
            self.stderr_task = None;
        }
        Ok(ProcessOutput {
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        })
    }

    async fn terminate(&mut self, grace: Duration) {
        if self.exited {
            return;
        }
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: pid belongs to a child we spawned and have not reaped yet.
            unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_code = status.code();
                self.exited = true;
            }
            _ => {
                warn!(pid = ?self.child.id(), "process ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "failed to kill process");
                }
                self.exited = true;
            }
        }
    }
}
