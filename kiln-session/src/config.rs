use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};
use crate::state::schema::Role;

/// Kiln configuration read from `~/.config/kiln/config.toml`.
///
/// Shared by the CLI and kiln-daemon. Every field has a default so a missing
/// file or a partial file is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    pub db_path: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
    pub headless: HeadlessConfig,
    pub interactive: InteractiveConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub check_interval_ms: u64,
    pub max_concurrent_tasks: usize,
    pub max_concurrent_by_role: RoleLimits,
    /// A running task older than this is force-failed by the next tick.
    pub task_timeout_ms: u64,
    pub max_task_attempts: u32,
    pub self_healing_enabled: bool,
    /// Upper bound on how long `stop` waits for in-flight tasks.
    pub stop_wait_ms: u64,
    pub reasoner: ReasonerKind,
}

/// Which reasoner answers failure-analysis and deadlock questions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonerKind {
    /// Deterministic rules, no model calls.
    #[default]
    Rules,
    /// A headless model call per decision.
    Model,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 5_000,
            max_concurrent_tasks: 3,
            max_concurrent_by_role: RoleLimits::default(),
            task_timeout_ms: 30 * 60 * 1000,
            max_task_attempts: 3,
            self_healing_enabled: true,
            stop_wait_ms: 30_000,
            reasoner: ReasonerKind::Rules,
        }
    }
}

impl SchedulerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.stop_wait_ms)
    }
}

/// Per-role concurrency ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleLimits {
    pub architect: usize,
    pub developer: usize,
    pub reviewer: usize,
}

impl Default for RoleLimits {
    fn default() -> Self {
        Self {
            architect: 1,
            developer: 2,
            reviewer: 1,
        }
    }
}

impl RoleLimits {
    pub fn get(&self, role: Role) -> usize {
        match role {
            Role::Architect => self.architect,
            Role::Developer => self.developer,
            Role::Reviewer => self.reviewer,
        }
    }
}

/// Single-shot model invocation used by architect and reviewer tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadlessConfig {
    pub binary: String,
    pub args: Vec<String>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Per-attempt timeout.
    pub timeout_ms: u64,
    /// Time between the terminate signal and the forced kill.
    pub kill_grace_ms: u64,
    pub working_dir: Option<PathBuf>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            args: vec!["-p".to_string(), "--output-format".to_string(), "text".to_string()],
            max_retries: 3,
            retry_delay_ms: 1_000,
            timeout_ms: 5 * 60 * 1000,
            kill_grace_ms: 5_000,
            working_dir: None,
        }
    }
}

impl HeadlessConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Long-lived session used by developer tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractiveConfig {
    pub binary: String,
    pub args: Vec<String>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Spans the whole session, not a single read.
    pub timeout_ms: u64,
    /// How long the session may keep running after it signalled completion.
    pub completion_grace_ms: u64,
    pub kill_grace_ms: u64,
    /// Also accept a `TASK_COMPLETE: {json}` line on stdout as the completion signal.
    pub accept_stdout_marker: bool,
    pub working_dir: Option<PathBuf>,
}

impl Default for InteractiveConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            args: vec!["-p".to_string(), "--dangerously-skip-permissions".to_string()],
            max_retries: 2,
            retry_delay_ms: 5_000,
            timeout_ms: 30 * 60 * 1000,
            completion_grace_ms: 2_000,
            kill_grace_ms: 5_000,
            accept_stdout_marker: false,
            working_dir: None,
        }
    }
}

impl InteractiveConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Send a feature back to a developer when its review is not approved.
    pub review_rework: bool,
    /// Rework rounds allowed per feature before the review result is accepted.
    pub max_rework_cycles: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            review_rework: false,
            max_rework_cycles: 2,
        }
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kiln")
        .join("config.toml")
}

/// Load config from `path` (or the default location).
///
/// A missing default file yields the defaults; a missing explicit path is an error.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<KilnConfig> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (config_path(), false),
    };

    if !path.exists() {
        if explicit {
            return Err(KilnError::ConfigNotFound(path.display().to_string()).into());
        }
        return Ok(KilnConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let config: KilnConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse config: {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

impl KilnConfig {
    /// Apply `KILN_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup, so tests avoid mutating env vars.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(db) = lookup("KILN_DB_PATH").filter(|s| !s.is_empty()) {
            self.db_path = Some(PathBuf::from(db));
        }
        if let Some(bin) = lookup("KILN_CLAUDE_BIN").filter(|s| !s.is_empty()) {
            self.headless.binary = bin.clone();
            self.interactive.binary = bin;
        }
        self
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(crate::db::default_db_path)
    }

    /// Reject values that would stall the scheduler or never run a task.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.check_interval_ms == 0 {
            return Err(invalid("scheduler.check_interval_ms must be greater than 0"));
        }
        if s.max_concurrent_tasks == 0 {
            return Err(invalid("scheduler.max_concurrent_tasks must be greater than 0"));
        }
        if s.max_task_attempts == 0 {
            return Err(invalid("scheduler.max_task_attempts must be greater than 0"));
        }
        if s.task_timeout_ms == 0 {
            return Err(invalid("scheduler.task_timeout_ms must be greater than 0"));
        }
        for role in Role::ALL {
            if s.max_concurrent_by_role.get(role) == 0 {
                return Err(invalid(&format!(
                    "scheduler.max_concurrent_by_role.{} must be greater than 0",
                    role
                )));
            }
        }
        if self.headless.max_retries == 0 || self.interactive.max_retries == 0 {
            return Err(invalid("max_retries must be greater than 0"));
        }
        if self.headless.binary.is_empty() || self.interactive.binary.is_empty() {
            return Err(invalid("binary must not be empty"));
        }
        if self.headless.timeout_ms == 0 || self.interactive.timeout_ms == 0 {
            return Err(invalid("timeout_ms must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> KilnError {
    KilnError::InvalidConfig(msg.to_string())
}
