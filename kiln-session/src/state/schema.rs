use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::KilnError;

pub type FeatureId = String;
pub type TaskId = i64;

/// Metadata key used to tag the lazily created self-healing feature.
pub const KIND_KEY: &str = "kind";
pub const SELF_HEALING_KIND: &str = "self_healing";

/// Role of a task inside the feature pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Architect,
    Developer,
    Reviewer,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Architect, Role::Developer, Role::Reviewer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Architect => "architect",
            Role::Developer => "developer",
            Role::Reviewer => "reviewer",
        }
    }

    /// The context type a completed task of this role contributes.
    pub fn context_type(&self) -> ContextType {
        match self {
            Role::Architect => ContextType::Architecture,
            Role::Developer => ContextType::Implementation,
            Role::Reviewer => ContextType::Review,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "architect" => Ok(Role::Architect),
            "developer" => Ok(Role::Developer),
            "reviewer" => Ok(Role::Reviewer),
            _ => Err(KilnError::invalid("role", s)),
        }
    }
}

/// Lifecycle status shared by features and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    InProgress,
    Complete,
    Failed,
}

pub type FeatureStatus = Status;
pub type TaskStatus = Status;

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::InProgress => "in_progress",
            Status::Complete => "complete",
            Status::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Complete | Status::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Status::Pending | Status::InProgress)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Status::Pending),
            "in_progress" | "in-progress" => Ok(Status::InProgress),
            "complete" => Ok(Status::Complete),
            "failed" => Ok(Status::Failed),
            _ => Err(KilnError::invalid("status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    /// One level higher, saturating at `Critical`.
    pub fn raised(&self) -> Priority {
        match self {
            Priority::Low => Priority::Normal,
            Priority::Normal => Priority::High,
            Priority::High | Priority::Critical => Priority::Critical,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(KilnError::invalid("priority", s)),
        }
    }
}

/// Kind of persisted context fed to later tasks of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    Architecture,
    Implementation,
    Review,
    /// Guidance injected by failure analysis before a retry.
    Guidance,
}

impl ContextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Architecture => "architecture",
            ContextType::Implementation => "implementation",
            ContextType::Review => "review",
            ContextType::Guidance => "guidance",
        }
    }
}

impl std::fmt::Display for ContextType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContextType {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "architecture" => Ok(ContextType::Architecture),
            "implementation" => Ok(ContextType::Implementation),
            "review" => Ok(ContextType::Review),
            "guidance" => Ok(ContextType::Guidance),
            _ => Err(KilnError::invalid("context type", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Feature,
    Task,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Feature => "feature",
            EntityType::Task => "task",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "feature" => Ok(EntityType::Feature),
            "task" => Ok(EntityType::Task),
            _ => Err(KilnError::invalid("entity type", s)),
        }
    }
}

/// Who caused a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    System,
    User,
    Ai,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::System => "system",
            Actor::User => "user",
            Actor::Ai => "ai",
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Actor {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(Actor::System),
            "user" => Ok(Actor::User),
            "ai" => Ok(Actor::Ai),
            _ => Err(KilnError::invalid("actor", s)),
        }
    }
}

/// A unit of requested work decomposed into a role pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub description: String,
    pub status: FeatureStatus,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Feature {
    pub fn kind(&self) -> Option<&str> {
        self.metadata.get(KIND_KEY).and_then(Value::as_str)
    }

    /// The bucket feature that collects self-healing tasks.
    pub fn is_self_healing(&self) -> bool {
        self.kind() == Some(SELF_HEALING_KIND)
    }
}

/// One role's unit of execution within a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub feature_id: FeatureId,
    pub role: Role,
    pub description: String,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_story_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persisted output of a completed task, read by later tasks of the same feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub id: i64,
    pub feature_id: FeatureId,
    pub context_type: ContextType,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit of a state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_state: Option<String>,
    pub to_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub actor: Actor,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Generic operational log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Technical discovery surfaced by an architect task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    pub id: i64,
    pub feature_id: FeatureId,
    pub task_id: TaskId,
    pub title: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

/// Architecture decision recorded by an architect task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: i64,
    pub feature_id: FeatureId,
    pub task_id: TaskId,
    pub title: String,
    pub rationale: String,
    pub created_at: DateTime<Utc>,
}

/// User story produced by an architect task. Developer tasks link back to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStory {
    pub id: i64,
    pub feature_id: FeatureId,
    pub task_id: TaskId,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_str() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("tester".parse::<Role>().is_err());
    }

    #[test]
    fn test_status_accepts_hyphenated_in_progress() {
        assert_eq!("in-progress".parse::<Status>().unwrap(), Status::InProgress);
        assert_eq!("IN_PROGRESS".parse::<Status>().unwrap(), Status::InProgress);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&Status::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::Low < Priority::Normal);
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!(Priority::Low.raised(), Priority::Normal);
        assert_eq!(Priority::Critical.raised(), Priority::Critical);
    }

    #[test]
    fn test_role_context_type() {
        assert_eq!(Role::Architect.context_type(), ContextType::Architecture);
        assert_eq!(Role::Developer.context_type(), ContextType::Implementation);
        assert_eq!(Role::Reviewer.context_type(), ContextType::Review);
    }

    #[test]
    fn test_self_healing_kind() {
        let mut metadata = Map::new();
        metadata.insert(KIND_KEY.to_string(), Value::from(SELF_HEALING_KIND));
        let feature = Feature {
            id: "f".to_string(),
            description: "heal".to_string(),
            status: Status::InProgress,
            priority: Priority::High,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            metadata,
        };
        assert!(feature.is_self_healing());
    }

    #[test]
    fn test_invalid_value_message() {
        let err = "nope".parse::<Priority>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid priority value: 'nope'");
    }
}
