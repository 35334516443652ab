use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::detect::detect_deadlocks;
use super::extract::DependencyExtractor;
use super::{Deadlock, DeadlockAction, DeadlockDecision, ItemState, WorkItem};
use crate::reasoning::ReasoningPort;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeadlockStats {
    pub detected: u64,
    pub resolved: u64,
}

/// Outcome of handling one detected deadlock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub deadlock: Deadlock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<DeadlockDecision>,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Detects deadlocks in a work set and applies the resolver's decisions to it.
pub struct DeadlockMonitor {
    extractor: Box<dyn DependencyExtractor>,
    reasoner: Arc<dyn ReasoningPort>,
    stats: DeadlockStats,
}

impl DeadlockMonitor {
    pub fn new(extractor: Box<dyn DependencyExtractor>, reasoner: Arc<dyn ReasoningPort>) -> Self {
        Self {
            extractor,
            reasoner,
            stats: DeadlockStats::default(),
        }
    }

    pub fn stats(&self) -> DeadlockStats {
        self.stats
    }

    pub fn detect(&self, items: &[WorkItem]) -> Vec<Deadlock> {
        detect_deadlocks(items, self.extractor.as_ref())
    }

    /// Detect, ask for a decision on each deadlock, and apply it to `items`.
    ///
    /// A failed reasoning call leaves that deadlock unresolved and moves on.
    pub async fn scan(&mut self, items: &mut [WorkItem]) -> Vec<Resolution> {
        let deadlocks = self.detect(items);
        let mut resolutions = Vec::with_capacity(deadlocks.len());

        for deadlock in deadlocks {
            self.stats.detected += 1;
            warn!(kind = %deadlock.kind, items = ?deadlock.items, "deadlock detected");

            match self.reasoner.resolve_deadlock(&deadlock, items).await {
                Ok(decision) => {
                    let resolved = apply_decision(&deadlock, &decision, items);
                    if resolved {
                        self.stats.resolved += 1;
                        info!(
                            kind = %deadlock.kind,
                            action = ?decision.action,
                            target = ?decision.target_id,
                            reason = %decision.reason,
                            "deadlock resolved"
                        );
                    }
                    resolutions.push(Resolution {
                        deadlock,
                        decision: Some(decision),
                        resolved,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(kind = %deadlock.kind, error = %e, "deadlock resolution failed");
                    resolutions.push(Resolution {
                        deadlock,
                        decision: None,
                        resolved: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        resolutions
    }
}

/// Apply `decision` to the work set. Returns whether anything changed.
///
/// The target must be one of the deadlocked items.
pub fn apply_decision(deadlock: &Deadlock, decision: &DeadlockDecision, items: &mut [WorkItem]) -> bool {
    let Some(target) = decision.target_id.filter(|id| deadlock.items.contains(id)) else {
        return false;
    };
    let Some(item) = items.iter_mut().find(|i| i.id == target) else {
        return false;
    };
    match decision.action {
        DeadlockAction::Prioritize => {
            item.priority = item.priority.raised();
            true
        }
        DeadlockAction::Unblock => {
            item.state = ItemState::Open;
            true
        }
        DeadlockAction::Wait => false,
    }
}
