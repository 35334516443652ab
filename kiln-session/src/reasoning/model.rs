use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{FailureAdvice, FailureContext, ReasoningError, ReasoningPort};
use crate::deadlock::{Deadlock, DeadlockDecision, WorkItem};
use crate::exec::HeadlessStrategy;
use crate::protocol::extract_json;

/// Asks the model through a headless call and reads back a small JSON decision.
pub struct ModelReasoner {
    headless: Arc<HeadlessStrategy>,
}

impl ModelReasoner {
    pub fn new(headless: Arc<HeadlessStrategy>) -> Self {
        Self { headless }
    }

    async fn ask<T: DeserializeOwned>(&self, prompt: &str) -> Result<T, ReasoningError> {
        let timeout = self.headless.config().timeout();
        let result = self
            .headless
            .invoke(prompt, timeout, &CancellationToken::new(), |raw| {
                extract_json(raw).ok_or_else(|| "no JSON object found".to_string())
            })
            .await;
        if !result.success {
            return Err(ReasoningError::Execution(result.error_message().to_string()));
        }
        let value = result
            .output
            .ok_or_else(|| ReasoningError::InvalidResponse("empty response".to_string()))?;
        debug!(response = %value, "reasoning response");
        serde_json::from_value(value).map_err(|e| ReasoningError::InvalidResponse(e.to_string()))
    }
}

pub fn failure_analysis_prompt(failure: &FailureContext) -> String {
    let mut prompt = String::from(
        "You are diagnosing a failed step in an automated development pipeline. \
         Decide whether retrying is likely to succeed.\n\n",
    );
    let _ = write!(
        prompt,
        "## Failed Task\n\nRole: {}\nFeature: {}\nTask: {}\nAttempts: {} of {}\n\n## Error\n\n{}\n\n",
        failure.task.role,
        failure.feature_description.trim(),
        failure.task.description.trim(),
        failure.task.attempts,
        failure.max_attempts,
        failure.error.trim(),
    );
    prompt.push_str(
        "## Output Format\n\nRespond with only this JSON object:\n\n```json\n\
         {\"retry\": true, \"modifiedPrompt\": \"optional revised instructions\", \
         \"additionalContext\": \"optional context for the next attempt\"}\n```",
    );
    prompt
}

pub fn deadlock_prompt(deadlock: &Deadlock, items: &[WorkItem]) -> String {
    let mut prompt = String::from(
        "You are resolving a scheduling deadlock between pending work items.\n\n",
    );
    let _ = write!(
        prompt,
        "## Deadlock\n\nType: {}\n{}\n\n## Items\n\n",
        deadlock.kind, deadlock.description
    );
    for item in items.iter().filter(|i| deadlock.items.contains(&i.id)) {
        let _ = writeln!(
            prompt,
            "- #{} [{:?}, priority {}] {}",
            item.id, item.state, item.priority, item.title
        );
    }
    prompt.push_str(
        "\n## Output Format\n\nChoose one action: prioritize (raise one item's priority), \
         unblock (let one item proceed) or wait (do nothing). Respond with only this JSON \
         object:\n\n```json\n{\"action\": \"prioritize\", \"targetId\": 1, \"reason\": \"string\"}\n```",
    );
    prompt
}

#[async_trait]
impl ReasoningPort for ModelReasoner {
    async fn analyze_failure(&self, failure: &FailureContext) -> Result<FailureAdvice, ReasoningError> {
        self.ask(&failure_analysis_prompt(failure)).await
    }

    async fn resolve_deadlock(
        &self,
        deadlock: &Deadlock,
        items: &[WorkItem],
    ) -> Result<DeadlockDecision, ReasoningError> {
        self.ask(&deadlock_prompt(deadlock, items)).await
    }
}
