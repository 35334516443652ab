//! Pluggable judgement calls: whether a failed task is worth retrying, and
//! how to break a deadlock.

pub mod model;
pub mod rules;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deadlock::{Deadlock, DeadlockDecision, WorkItem};
use crate::exec::FailureKind;
use crate::state::schema::Task;

pub use model::ModelReasoner;
pub use rules::RuleBasedReasoner;

#[derive(Error, Debug)]
pub enum ReasoningError {
    #[error("reasoning call failed: {0}")]
    Execution(String),

    #[error("invalid reasoning response: {0}")]
    InvalidResponse(String),
}

/// Facts about a failed task handed to failure analysis.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub task: Task,
    pub feature_description: String,
    pub error: String,
    pub failure: Option<FailureKind>,
    pub max_attempts: u32,
}

impl FailureContext {
    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.task.attempts)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureAdvice {
    pub retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<String>,
}

impl FailureAdvice {
    pub fn give_up() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait ReasoningPort: Send + Sync {
    async fn analyze_failure(&self, failure: &FailureContext) -> Result<FailureAdvice, ReasoningError>;

    async fn resolve_deadlock(
        &self,
        deadlock: &Deadlock,
        items: &[WorkItem],
    ) -> Result<DeadlockDecision, ReasoningError>;
}
