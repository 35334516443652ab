use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::schema::Role;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryItem {
    pub title: String,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionItem {
    pub title: String,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryItem {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArchitectOutput {
    pub discoveries: Vec<DiscoveryItem>,
    pub decisions: Vec<DecisionItem>,
    pub user_stories: Vec<StoryItem>,
    pub design: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeveloperOutput {
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub tests_added: Vec<String>,
    pub implementation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub next_steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewerOutput {
    pub approved: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

/// Parsed output of one task, tagged by the role that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum RoleOutput {
    Architect(ArchitectOutput),
    Developer(DeveloperOutput),
    Reviewer(ReviewerOutput),
}

impl RoleOutput {
    pub fn role(&self) -> Role {
        match self {
            RoleOutput::Architect(_) => Role::Architect,
            RoleOutput::Developer(_) => Role::Developer,
            RoleOutput::Reviewer(_) => Role::Reviewer,
        }
    }

    pub fn to_value(&self) -> Value {
        let value = match self {
            RoleOutput::Architect(o) => serde_json::to_value(o),
            RoleOutput::Developer(o) => serde_json::to_value(o),
            RoleOutput::Reviewer(o) => serde_json::to_value(o),
        };
        // Plain structs of strings, vecs and bools always serialize.
        value.unwrap_or(Value::Null)
    }

    /// Re-read a stored task output for `role`.
    pub fn from_value(role: Role, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match role {
            Role::Architect => RoleOutput::Architect(serde_json::from_value(value)?),
            Role::Developer => RoleOutput::Developer(serde_json::from_value(value)?),
            Role::Reviewer => RoleOutput::Reviewer(serde_json::from_value(value)?),
        })
    }
}
