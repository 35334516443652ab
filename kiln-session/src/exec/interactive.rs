use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::completion::CompletionRegistry;
use super::process::{Invocation, ProcessLauncher, ProcessOutput};
use super::{AttemptFailure, ExecutionRequest, ExecutionResult, ExecutionStrategy, FailureKind};
use crate::config::InteractiveConfig;
use crate::protocol::{build_interactive_prompt, extract_json};
use crate::state::schema::TaskId;

/// Stdout prefix accepted as a completion signal when `accept_stdout_marker` is on.
pub const STDOUT_MARKER: &str = "TASK_COMPLETE:";

/// One long-lived session per attempt. The session is done only when its
/// completion arrives through the `CompletionRegistry`, never on process exit.
pub struct InteractiveStrategy {
    config: InteractiveConfig,
    launcher: Arc<dyn ProcessLauncher>,
    completions: CompletionRegistry,
}

enum SessionEnd {
    Completed(Value),
    Exited(ProcessOutput),
    TimedOut,
    Cancelled,
}

impl InteractiveStrategy {
    pub fn new(
        config: InteractiveConfig,
        launcher: Arc<dyn ProcessLauncher>,
        completions: CompletionRegistry,
    ) -> Self {
        Self {
            config,
            launcher,
            completions,
        }
    }

    pub fn completions(&self) -> &CompletionRegistry {
        &self.completions
    }

    fn invocation(&self, prompt: &str) -> Invocation {
        Invocation::new(&self.config.binary)
            .args(self.config.args.iter().cloned())
            .stdin(prompt)
            .cwd(self.config.working_dir.clone())
    }

    async fn session(
        &self,
        task_id: TaskId,
        invocation: &Invocation,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, AttemptFailure> {
        // Register before spawning so an early completion is never missed.
        let mut registration = self.completions.register(task_id);
        let mut handle = self.launcher.spawn(invocation).await?;
        let mut markers = if self.config.accept_stdout_marker {
            handle.stdout_lines()
        } else {
            None
        };

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let end = loop {
            tokio::select! {
                payload = &mut registration.receiver => match payload {
                    Ok(value) => break SessionEnd::Completed(value),
                    // Sender only drops with the registry entry, which this guard owns.
                    Err(_) => break SessionEnd::TimedOut,
                },
                line = next_line(&mut markers) => match line {
                    Some(line) => {
                        if let Some(value) = parse_marker(&line) {
                            debug!(task_id, "completion marker found on stdout");
                            break SessionEnd::Completed(value);
                        }
                    }
                    None => markers = None,
                },
                exited = handle.wait() => match exited {
                    Ok(output) => break SessionEnd::Exited(output),
                    Err(e) => return Err(e.into()),
                },
                _ = &mut deadline => break SessionEnd::TimedOut,
                _ = cancel.cancelled() => break SessionEnd::Cancelled,
            }
        };

        match end {
            SessionEnd::Completed(value) => {
                info!(task_id, "session signalled completion");
                // Let the session wind down on its own before forcing it.
                if tokio::time::timeout(self.config.completion_grace(), handle.wait())
                    .await
                    .is_err()
                {
                    handle.terminate(self.config.kill_grace()).await;
                }
                Ok(value)
            }
            SessionEnd::Exited(output) => {
                // A completion racing the exit still counts.
                if let Some(value) = registration.try_take() {
                    return Ok(value);
                }
                // The exit can win the race against the last streamed line.
                if self.config.accept_stdout_marker {
                    if let Some(value) = output.stdout.lines().find_map(parse_marker) {
                        debug!(task_id, "completion marker found in final stdout");
                        return Ok(value);
                    }
                }
                match output.exit_code {
                    Some(0) => Err(AttemptFailure::new(
                        FailureKind::NoCompletion,
                        "process exited without calling complete_task",
                    )),
                    Some(code) => Err(AttemptFailure::new(
                        FailureKind::Exit,
                        format!("process exited with code {}: {}", code, output.stderr.trim()),
                    )),
                    None => Err(AttemptFailure::new(
                        FailureKind::Exit,
                        format!("process terminated by signal: {}", output.stderr.trim()),
                    )),
                }
            }
            SessionEnd::TimedOut => {
                warn!(task_id, ?timeout, "interactive session timed out, terminating");
                handle.terminate(self.config.kill_grace()).await;
                Err(AttemptFailure::new(
                    FailureKind::Timeout,
                    format!("session timed out after {}s", timeout.as_secs_f64()),
                ))
            }
            SessionEnd::Cancelled => {
                info!(task_id, "interactive session cancelled, terminating");
                handle.terminate(self.config.kill_grace()).await;
                Err(AttemptFailure::new(FailureKind::Cancelled, "session cancelled"))
            }
        }
    }
}

async fn next_line(lines: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match lines {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn parse_marker(line: &str) -> Option<Value> {
    let rest = line.trim().strip_prefix(STDOUT_MARKER)?;
    extract_json(rest)
}

#[async_trait]
impl ExecutionStrategy for InteractiveStrategy {
    fn name(&self) -> &'static str {
        "interactive"
    }

    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let prompt = build_interactive_prompt(
            request.task_id,
            request.role,
            &request.description,
            &request.context,
        );
        let invocation = self.invocation(&prompt);
        // One deadline per session; no backoff inside a session.
        let timeout = request.timeout_override.unwrap_or_else(|| self.config.timeout());
        let max = self.config.max_retries.max(1);
        let started = Instant::now();
        let mut last: Option<AttemptFailure> = None;

        for attempt in 1..=max {
            debug!(task_id = request.task_id, attempt, max, "starting interactive session");
            match self
                .session(request.task_id, &invocation, timeout, &request.cancel)
                .await
            {
                Ok(value) => return ExecutionResult::succeeded(value, started.elapsed(), attempt),
                Err(failure) if failure.kind == FailureKind::Configuration => {
                    error!(task_id = request.task_id, error = %failure.message, "model executable unavailable, not retrying");
                    return ExecutionResult::failed(
                        FailureKind::Configuration,
                        failure.message,
                        started.elapsed(),
                        attempt,
                    );
                }
                Err(failure) if failure.kind == FailureKind::Cancelled => {
                    return ExecutionResult::failed(
                        FailureKind::Cancelled,
                        failure.message,
                        started.elapsed(),
                        attempt,
                    );
                }
                Err(failure) => {
                    warn!(task_id = request.task_id, attempt, max, kind = ?failure.kind, error = %failure.message, "interactive session failed");
                    last = Some(failure);
                    if attempt < max {
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.retry_delay()) => {}
                            _ = request.cancel.cancelled() => {
                                return ExecutionResult::failed(
                                    FailureKind::Cancelled,
                                    "session cancelled before retry",
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
        ExecutionResult::failed(
            last.kind,
            format!("Failed after {} attempts: {}", max, last.message),
            started.elapsed(),
            max,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::{exit, ok, Script, ScriptedLauncher};
    use crate::state::schema::Role;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn config(max_retries: u32) -> InteractiveConfig {
        InteractiveConfig {
            binary: "fake-model".to_string(),
            args: vec![],
            max_retries,
            retry_delay_ms: 50,
            timeout_ms: 10_000,
            completion_grace_ms: 100,
            kill_grace_ms: 10,
            accept_stdout_marker: false,
            working_dir: None,
        }
    }

    fn strategy(launcher: &ScriptedLauncher, config: InteractiveConfig) -> InteractiveStrategy {
        InteractiveStrategy::new(config, Arc::new(launcher.clone()), CompletionRegistry::new())
    }

    fn request(task_id: TaskId) -> ExecutionRequest {
        ExecutionRequest::new(task_id, Role::Developer, "Implement login")
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_exit_without_completion_fails() {
        let launcher = ScriptedLauncher::new([ok("all done!")]);
        let result = strategy(&launcher, config(1)).execute(request(1)).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("without calling"));
        assert_eq!(result.failure, Some(FailureKind::NoCompletion));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_event_resolves_and_terminates() {
        let launcher = ScriptedLauncher::new([Script::Hang(vec![])]);
        let strategy = Arc::new(strategy(&launcher, config(1)));
        let registry = strategy.completions().clone();

        let runner = {
            let strategy = strategy.clone();
            tokio::spawn(async move { strategy.execute(request(11)).await })
        };
        while !registry.is_waiting(11) {
            tokio::task::yield_now().await;
        }
        assert!(registry.complete(11, json!({"summary": "implemented"})));

        let result = runner.await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, Some(json!({"summary": "implemented"})));
        assert_eq!(launcher.terminated.load(Ordering::SeqCst), 1);
        assert!(!registry.is_waiting(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stdout_marker_ignored_by_default() {
        let launcher = ScriptedLauncher::new([Script::Hang(vec![
            r#"TASK_COMPLETE: {"summary": "x"}"#.to_string(),
        ])]);
        let mut cfg = config(1);
        cfg.timeout_ms = 1_000;
        let result = strategy(&launcher, cfg).execute(request(2)).await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stdout_marker_accepted_when_enabled() {
        let launcher = ScriptedLauncher::new([Script::Hang(vec![
            "working...".to_string(),
            r#"TASK_COMPLETE: {"summary": "via stdout"}"#.to_string(),
        ])]);
        let mut cfg = config(1);
        cfg.accept_stdout_marker = true;
        let result = strategy(&launcher, cfg).execute(request(3)).await;

        assert!(result.success);
        assert_eq!(result.output.unwrap()["summary"], "via stdout");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_terminates_session() {
        let launcher = ScriptedLauncher::new([Script::Hang(vec![]), Script::Hang(vec![])]);
        let mut cfg = config(2);
        cfg.timeout_ms = 500;
        let result = strategy(&launcher, cfg).execute(request(4)).await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Timeout));
        assert!(result.error.unwrap().contains("Failed after 2 attempts"));
        assert_eq!(launcher.spawn_count(), 2);
        assert_eq!(launcher.terminated.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonzero_exit_reports_stderr_and_retries() {
        let launcher = ScriptedLauncher::new([exit(2, "auth failed"), exit(2, "auth failed")]);
        let result = strategy(&launcher, config(2)).execute(request(5)).await;

        assert!(!result.success);
        assert_eq!(launcher.spawn_count(), 2);
        let error = result.error.unwrap();
        assert!(error.contains("code 2"), "{error}");
        assert!(error.contains("auth failed"), "{error}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_executable_is_configuration_error() {
        let launcher = ScriptedLauncher::new([Script::NotFound]);
        let result = strategy(&launcher, config(2)).execute(request(6)).await;

        assert_eq!(result.failure, Some(FailureKind::Configuration));
        assert_eq!(launcher.spawn_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_in_final_stdout_counts_after_exit() {
        let launcher = ScriptedLauncher::new([ok(r#"TASK_COMPLETE: {"summary": "done"}"#)]);
        let mut cfg = config(1);
        cfg.accept_stdout_marker = true;
        let result = strategy(&launcher, cfg).execute(request(7)).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output.unwrap()["summary"], "done");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_session_printing_marker_then_exiting_succeeds() {
        let cfg = InteractiveConfig {
            binary: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"cat >/dev/null; echo 'TASK_COMPLETE: {"summary":"done"}'; exit 0"#.to_string(),
            ],
            accept_stdout_marker: true,
            ..config(1)
        };
        let strategy = InteractiveStrategy::new(
            cfg,
            Arc::new(crate::exec::TokioLauncher),
            CompletionRegistry::new(),
        );
        for task_id in 0..20 {
            let result = strategy.execute(request(100 + task_id)).await;
            assert!(result.success, "run {task_id}: {:?}", result.error);
            assert_eq!(result.output.unwrap()["summary"], "done");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_terminates_session_without_retry() {
        let launcher = ScriptedLauncher::new([Script::Hang(vec![]), Script::Hang(vec![])]);
        let req = request(8);
        let cancel = req.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let result = strategy(&launcher, config(2)).execute(req).await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Cancelled));
        assert_eq!(launcher.spawn_count(), 1);
        assert_eq!(launcher.terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_parse_marker() {
        assert_eq!(
            parse_marker(r#"  TASK_COMPLETE: {"a": 1}"#),
            Some(json!({"a": 1}))
        );
        assert_eq!(parse_marker("TASK_COMPLETE: not json"), None);
        assert_eq!(parse_marker(r#"{"a": 1}"#), None);
    }
}
