//! Deadlock detection over a transient set of pending work items.
//!
//! Items reference each other in free text ("depends on #12"). The text is
//! read through a `DependencyExtractor`, so the cycle and conflict checks do
//! not care how dependencies were declared.

pub mod detect;
pub mod extract;
pub mod monitor;

use serde::{Deserialize, Serialize};

use crate::error::KilnError;
use crate::state::schema::Priority;

pub use detect::detect_deadlocks;
pub use extract::{DependencyExtractor, RegexExtractor};
pub use monitor::{DeadlockMonitor, DeadlockStats, Resolution};

pub type ItemId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    #[default]
    Open,
    Blocked,
}

/// A pending piece of work as seen by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub state: ItemState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default)]
    pub priority: Priority,
}

impl WorkItem {
    pub fn new(id: ItemId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            body: String::new(),
            state: ItemState::Open,
            assignee: None,
            priority: Priority::Normal,
        }
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn blocked(mut self) -> Self {
        self.state = ItemState::Blocked;
        self
    }

    pub fn assignee(mut self, who: impl Into<String>) -> Self {
        self.assignee = Some(who.into());
        self
    }

    /// Title and body, the text dependency references are read from.
    pub fn text(&self) -> String {
        format!("{}\n{}", self.title, self.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlockKind {
    Circular,
    Resource,
    Dependency,
}

impl DeadlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadlockKind::Circular => "circular",
            DeadlockKind::Resource => "resource",
            DeadlockKind::Dependency => "dependency",
        }
    }
}

impl std::fmt::Display for DeadlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deadlock {
    pub kind: DeadlockKind,
    /// Items involved. For `circular` this is the cycle in traversal order.
    pub items: Vec<ItemId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub description: String,
}

/// What a resolver decided to do about one deadlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlockAction {
    /// Raise the target's priority.
    Prioritize,
    /// Clear the target's blocked state.
    Unblock,
    Wait,
}

impl DeadlockAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadlockAction::Prioritize => "prioritize",
            DeadlockAction::Unblock => "unblock",
            DeadlockAction::Wait => "wait",
        }
    }
}

impl std::fmt::Display for DeadlockAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeadlockAction {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prioritize" => Ok(DeadlockAction::Prioritize),
            "unblock" => Ok(DeadlockAction::Unblock),
            "wait" => Ok(DeadlockAction::Wait),
            _ => Err(KilnError::invalid("deadlock action", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadlockDecision {
    pub action: DeadlockAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<ItemId>,
    #[serde(default)]
    pub reason: String,
}
