//! Execution strategies that turn a task into a model invocation.
//!
//! Strategies never return errors. Every failure comes back as an
//! `ExecutionResult` with `success == false` and a readable `error`.

pub mod completion;
pub mod headless;
pub mod interactive;
pub mod process;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::protocol::ContextEntry;
use crate::state::schema::{Role, TaskId};

pub use completion::{CompletionRegistry, Registration};
pub use headless::HeadlessStrategy;
pub use interactive::InteractiveStrategy;
pub use process::{Invocation, ProcessError, ProcessHandle, ProcessLauncher, ProcessOutput, TokioLauncher};

/// Everything a strategy needs to run one task.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: TaskId,
    pub role: Role,
    pub description: String,
    pub context: Vec<ContextEntry>,
    pub custom_instructions: Option<String>,
    pub timeout_override: Option<Duration>,
    /// Fires when the scheduler gives up on the task. The strategy terminates
    /// its process with the usual grace window and returns.
    pub cancel: CancellationToken,
}

impl ExecutionRequest {
    pub fn new(task_id: TaskId, role: Role, description: impl Into<String>) -> Self {
        Self {
            task_id,
            role,
            description: description.into(),
            context: Vec::new(),
            custom_instructions: None,
            timeout_override: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Why an execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The model executable is missing. Not worth retrying.
    Configuration,
    Timeout,
    /// Non-zero exit.
    Exit,
    Spawn,
    /// Output did not match the role's schema.
    Parse,
    /// Interactive session ended without signalling completion.
    NoCompletion,
    /// Withdrawn through the request's cancellation token.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration: Duration,
    pub failure: Option<FailureKind>,
    pub attempts: u32,
    /// Raw model output kept when parsing failed.
    pub raw_output: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded(output: Value, duration: Duration, attempts: u32) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            duration,
            failure: None,
            attempts,
            raw_output: None,
        }
    }

    pub fn failed(kind: FailureKind, error: impl Into<String>, duration: Duration, attempts: u32) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            duration,
            failure: Some(kind),
            attempts,
            raw_output: None,
        }
    }

    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("unknown error")
    }
}

/// A way of running a task through the model.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult;
}

/// One failed attempt inside a strategy's retry loop.
#[derive(Debug, Clone)]
pub(crate) struct AttemptFailure {
    pub kind: FailureKind,
    pub message: String,
    pub raw: Option<String>,
}

impl AttemptFailure {
    pub(crate) fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            raw: None,
        }
    }
}

impl From<ProcessError> for AttemptFailure {
    fn from(e: ProcessError) -> Self {
        let kind = match &e {
            ProcessError::NotFound(_) => FailureKind::Configuration,
            ProcessError::TimedOut(_) => FailureKind::Timeout,
            ProcessError::Cancelled => FailureKind::Cancelled,
            ProcessError::Spawn { .. } | ProcessError::Io(_) => FailureKind::Spawn,
        };
        AttemptFailure::new(kind, e.to_string())
    }
}

/// `base * 2^(attempt - 1)`, saturating.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor)
}
