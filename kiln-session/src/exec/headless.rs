use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::process::{Invocation, ProcessLauncher};
use super::{backoff_delay, AttemptFailure, ExecutionRequest, ExecutionResult, ExecutionStrategy, FailureKind};
use crate::config::HeadlessConfig;
use crate::protocol::{build_prompt, parse_output};

/// One subprocess per attempt, prompt on stdin, JSON expected on stdout.
pub struct HeadlessStrategy {
    config: HeadlessConfig,
    launcher: Arc<dyn ProcessLauncher>,
}

impl HeadlessStrategy {
    pub fn new(config: HeadlessConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self { config, launcher }
    }

    pub fn config(&self) -> &HeadlessConfig {
        &self.config
    }

    fn invocation(&self, prompt: &str) -> Invocation {
        Invocation::new(&self.config.binary)
            .args(self.config.args.iter().cloned())
            .stdin(prompt)
            .cwd(self.config.working_dir.clone())
    }

    /// Run `prompt` with retry and backoff, reading stdout through `parse`.
    ///
    /// `parse` returns the structured value or a message describing why the
    /// output was rejected. Cancelling `cancel` terminates the running
    /// attempt and skips the remaining ones.
    pub async fn invoke<F>(
        &self,
        prompt: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        parse: F,
    ) -> ExecutionResult
    where
        F: Fn(&str) -> Result<Value, String> + Send + Sync,
    {
        let invocation = self.invocation(prompt);
        let max = self.config.max_retries.max(1);
        let started = Instant::now();
        let mut last: Option<AttemptFailure> = None;

        for attempt in 1..=max {
            debug!(attempt, max, binary = %self.config.binary, "headless attempt");
            match self.attempt(&invocation, timeout, cancel, &parse).await {
                Ok(value) => {
                    info!(attempt, elapsed_ms = started.elapsed().as_millis() as u64, "headless execution succeeded");
                    return ExecutionResult::succeeded(value, started.elapsed(), attempt);
                }
                Err(failure) if failure.kind == FailureKind::Configuration => {
                    error!(error = %failure.message, "model executable unavailable, not retrying");
                    return ExecutionResult::failed(
                        FailureKind::Configuration,
                        failure.message,
                        started.elapsed(),
                        attempt,
                    );
                }
                Err(failure) if failure.kind == FailureKind::Cancelled => {
                    info!(attempt, "headless execution cancelled");
                    return ExecutionResult::failed(
                        FailureKind::Cancelled,
                        failure.message,
                        started.elapsed(),
                        attempt,
                    );
                }
                Err(failure) => {
                    warn!(attempt, max, kind = ?failure.kind, error = %failure.message, "headless attempt failed");
                    last = Some(failure);
                    if attempt < max {
                        tokio::select! {
                            _ = tokio::time::sleep(backoff_delay(self.config.retry_delay(), attempt)) => {}
                            _ = cancel.cancelled() => {
                                return ExecutionResult::failed(
                                    FailureKind::Cancelled,
                                    "execution cancelled during backoff",
                                    started.elapsed(),
                                    attempt,
                                );
                            }
                        }
                    }
                }
            }
        }

        let last = last.unwrap_or_else(|| AttemptFailure::new(FailureKind::Exit, "no attempt was made"));
        let mut result = ExecutionResult::failed(
            last.kind,
            format!("Failed after {} attempts: {}", max, last.message),
            started.elapsed(),
            max,
        );
        result.raw_output = last.raw;
        result
    }

    async fn attempt<F>(
        &self,
        invocation: &Invocation,
        timeout: Duration,
        cancel: &CancellationToken,
        parse: &F,
    ) -> Result<Value, AttemptFailure>
    where
        F: Fn(&str) -> Result<Value, String> + Send + Sync,
    {
        let output = self
            .launcher
            .run(invocation, timeout, self.config.kill_grace(), cancel)
            .await?;

        if !output.success() {
            let stderr = output.stderr.trim();
            let detail = if stderr.is_empty() {
                output.stdout.trim()
            } else {
                stderr
            };
            let message = match output.exit_code {
                Some(code) => format!("process exited with code {}: {}", code, detail),
                None => format!("process terminated by signal: {}", detail),
            };
            return Err(AttemptFailure::new(FailureKind::Exit, message));
        }

        parse(&output.stdout).map_err(|message| AttemptFailure {
            kind: FailureKind::Parse,
            message,
            raw: Some(output.stdout.clone()),
        })
    }
}

#[async_trait]
impl ExecutionStrategy for HeadlessStrategy {
    fn name(&self) -> &'static str {
        "headless"
    }

    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let prompt = build_prompt(
            request.role,
            &request.description,
            &request.context,
            request.custom_instructions.as_deref(),
        );
        let timeout = request.timeout_override.unwrap_or_else(|| self.config.timeout());
        let role = request.role;
        debug!(task_id = request.task_id, %role, prompt_len = prompt.len(), "executing headless task");
        self.invoke(&prompt, timeout, &request.cancel, move |raw| {
            parse_output(role, raw)
                .map(|output| output.to_value())
                .map_err(|e| e.to_string())
        })
        .await
    }
}
