//! The role graph a feature moves through.
//!
//! Forward edges are fixed: architect, developer, reviewer. A reviewer to
//! developer rework edge is added only when `pipeline.review_rework` is set.

use serde_json::Value;

use crate::config::PipelineConfig;
use crate::state::schema::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeCondition {
    Always,
    /// The completed review did not approve the work.
    ReviewRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: Role,
    pub to: Role,
    pub when: EdgeCondition,
}

/// The step chosen after a task completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub role: Role,
    /// Goes back to an earlier role.
    pub rework: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    edges: Vec<Edge>,
    max_rework_cycles: u32,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::forward()
    }
}

impl Pipeline {
    /// architect -> developer -> reviewer, nothing after.
    pub fn forward() -> Self {
        Self {
            edges: vec![
                Edge {
                    from: Role::Architect,
                    to: Role::Developer,
                    when: EdgeCondition::Always,
                },
                Edge {
                    from: Role::Developer,
                    to: Role::Reviewer,
                    when: EdgeCondition::Always,
                },
            ],
            max_rework_cycles: 0,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut pipeline = Self::forward();
        if config.review_rework {
            // Conditional edges are listed first so they win over `Always`.
            pipeline.edges.insert(
                0,
                Edge {
                    from: Role::Reviewer,
                    to: Role::Developer,
                    when: EdgeCondition::ReviewRejected,
                },
            );
            pipeline.max_rework_cycles = config.max_rework_cycles;
        }
        pipeline
    }

    pub fn first(&self) -> Role {
        Role::Architect
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Role that follows `completed` on the unconditional path.
    pub fn next_role(&self, completed: Role) -> Option<Role> {
        self.edges
            .iter()
            .find(|e| e.from == completed && e.when == EdgeCondition::Always)
            .map(|e| e.to)
    }

    /// Pick the step after a task of `completed` finished with `output`.
    ///
    /// `rework_rounds` is how many times this feature already went back.
    pub fn next(&self, completed: Role, output: &Value, rework_rounds: u32) -> Option<Step> {
        self.edges
            .iter()
            .filter(|e| e.from == completed)
            .find(|e| match e.when {
                EdgeCondition::Always => true,
                EdgeCondition::ReviewRejected => {
                    rework_rounds < self.max_rework_cycles && !review_approved(output)
                }
            })
            .map(|e| Step {
                role: e.to,
                rework: e.when != EdgeCondition::Always,
            })
    }
}

/// A review without an explicit `approved: true` counts as rejected.
pub fn review_approved(output: &Value) -> bool {
    output.get("approved").and_then(Value::as_bool).unwrap_or(false)
}
