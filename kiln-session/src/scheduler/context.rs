//! Prior context assembled for a task before it is dispatched.

use std::fmt::Write;

use rusqlite::Connection;

use crate::db::{artifacts, contexts, StoreResult};
use crate::protocol::ContextEntry;
use crate::state::schema::{Feature, Role, Task};

/// Feature description, the linked user story, every context row written so
/// far, and for developers and reviewers the architect's discoveries and
/// decisions.
pub fn build_task_context(
    conn: &Connection,
    task: &Task,
    feature: &Feature,
) -> StoreResult<Vec<ContextEntry>> {
    let mut entries = vec![ContextEntry::new("Feature", &feature.description)];

    if let Some(story) = task
        .user_story_id
        .map(|id| artifacts::find_user_story(conn, id))
        .transpose()?
        .flatten()
    {
        let mut content = story.description.clone();
        if !story.acceptance_criteria.is_empty() {
            content.push_str("\n\nAcceptance criteria:");
            for criterion in &story.acceptance_criteria {
                let _ = write!(content, "\n- {}", criterion);
            }
        }
        entries.push(ContextEntry::new(format!("User Story: {}", story.title), content));
    }

    for record in contexts::list_by_feature(conn, &feature.id)? {
        let label = match &record.author {
            Some(author) => format!("{} ({})", record.context_type, author),
            None => record.context_type.to_string(),
        };
        entries.push(ContextEntry::new(label, record.content));
    }

    if matches!(task.role, Role::Developer | Role::Reviewer) {
        let discoveries = artifacts::list_discoveries(conn, &feature.id)?;
        if !discoveries.is_empty() {
            let content = discoveries
                .iter()
                .map(|d| format!("- {}: {}", d.title, d.detail))
                .collect::<Vec<_>>()
                .join("\n");
            entries.push(ContextEntry::new("Technical Discoveries", content));
        }
        let decisions = artifacts::list_decisions(conn, &feature.id)?;
        if !decisions.is_empty() {
            let content = decisions
                .iter()
                .map(|d| format!("- {}: {}", d.title, d.rationale))
                .collect::<Vec<_>>()
                .join("\n");
            entries.push(ContextEntry::new("Architecture Decisions", content));
        }
    }

    Ok(entries)
}
