use async_trait::async_trait;

use super::{FailureAdvice, FailureContext, ReasoningError, ReasoningPort};
use crate::deadlock::{Deadlock, DeadlockAction, DeadlockDecision, DeadlockKind, ItemId, WorkItem};
use crate::exec::FailureKind;

/// Deterministic default reasoner. Needs no model calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedReasoner;

#[async_trait]
impl ReasoningPort for RuleBasedReasoner {
    async fn analyze_failure(&self, failure: &FailureContext) -> Result<FailureAdvice, ReasoningError> {
        if failure.attempts_remaining() == 0 {
            return Ok(FailureAdvice::give_up());
        }
        let guidance = match failure.failure {
            Some(FailureKind::Configuration) => return Ok(FailureAdvice::give_up()),
            Some(FailureKind::Parse) => {
                "The previous response could not be parsed. Reply with only the JSON object \
                 described in the output format, with no surrounding prose."
                    .to_string()
            }
            Some(FailureKind::Timeout) => {
                "The previous attempt timed out. Make a smaller, focused change and finish \
                 within the time limit."
                    .to_string()
            }
            Some(FailureKind::NoCompletion) => {
                "The previous session ended without calling complete_task. You must call \
                 complete_task with your report when the work is done."
                    .to_string()
            }
            _ => format!(
                "The previous attempt failed with: {}. Avoid repeating the same approach.",
                failure.error
            ),
        };
        Ok(FailureAdvice {
            retry: true,
            modified_prompt: None,
            additional_context: Some(guidance),
        })
    }

    async fn resolve_deadlock(
        &self,
        deadlock: &Deadlock,
        items: &[WorkItem],
    ) -> Result<DeadlockDecision, ReasoningError> {
        let involved: Vec<&WorkItem> = deadlock
            .items
            .iter()
            .filter_map(|id| items.iter().find(|i| i.id == *id))
            .collect();

        let decision = match deadlock.kind {
            // Forcing the oldest item in the cycle through breaks it.
            DeadlockKind::Circular => match lowest_id(&involved) {
                Some(id) => decision(DeadlockAction::Unblock, Some(id), "break the cycle at its oldest item"),
                None => decision(DeadlockAction::Wait, None, "cycle items are no longer pending"),
            },
            DeadlockKind::Resource => {
                let winner = involved
                    .iter()
                    .max_by(|a, b| a.priority.cmp(&b.priority).then(b.id.cmp(&a.id)))
                    .map(|i| i.id);
                match winner {
                    Some(id) => decision(DeadlockAction::Prioritize, Some(id), "let the most important claimant go first"),
                    None => decision(DeadlockAction::Wait, None, "no claimant is pending"),
                }
            }
            // items[0] is the blocked item; the rest are what it waits on.
            DeadlockKind::Dependency => match deadlock.items.get(1) {
                Some(&blocker) => decision(DeadlockAction::Prioritize, Some(blocker), "finish the blocking item first"),
                None => decision(DeadlockAction::Wait, None, "nothing to prioritize"),
            },
        };
        Ok(decision)
    }
}

fn lowest_id(items: &[&WorkItem]) -> Option<ItemId> {
    items.iter().map(|i| i.id).min()
}

fn decision(action: DeadlockAction, target_id: Option<ItemId>, reason: &str) -> DeadlockDecision {
    DeadlockDecision {
        action,
        target_id,
        reason: reason.to_string(),
    }
}
