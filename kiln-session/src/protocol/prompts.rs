use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::state::schema::{Role, TaskId};

/// Name of the tool action an interactive session calls when it is done.
pub const COMPLETION_ACTION: &str = "complete_task";

/// One labelled block of prior context handed to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub label: String,
    pub content: String,
}

impl ContextEntry {
    pub fn new(label: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            content: content.into(),
        }
    }
}

fn system_prompt(role: Role) -> &'static str {
    match role {
        Role::Architect => {
            "You are a senior software architect. Break the requested feature into a \
             technical design, record the discoveries and decisions that shape it, and \
             split the work into user stories a developer can implement independently."
        }
        Role::Developer => {
            "You are a senior software developer. Implement the requested change in the \
             repository, add tests for new behavior, and keep the change focused on the task."
        }
        Role::Reviewer => {
            "You are a meticulous code reviewer. Review the implementation of the feature \
             for correctness, test coverage and maintainability, and decide whether it can ship."
        }
    }
}

fn requirements(role: Role) -> &'static [&'static str] {
    match role {
        Role::Architect => &[
            "Identify the components that change and how they interact.",
            "List technical discoveries that later tasks must know about.",
            "Record each architecture decision with its rationale.",
            "Write user stories with acceptance criteria.",
        ],
        Role::Developer => &[
            "Follow the architecture decisions already recorded for this feature.",
            "Add or update tests covering the change.",
            "Report every file you created or modified.",
        ],
        Role::Reviewer => &[
            "Check the implementation against the architecture and user stories.",
            "List concrete issues that must be fixed before approval.",
            "Approve only if no blocking issues remain.",
        ],
    }
}

fn output_schema(role: Role) -> &'static str {
    match role {
        Role::Architect => {
            r#"{
  "discoveries": [{"title": "string", "detail": "string"}],
  "decisions": [{"title": "string", "rationale": "string"}],
  "userStories": [{"title": "string", "description": "string", "acceptanceCriteria": ["string"]}],
  "design": "string"
}"#
        }
        Role::Developer => {
            r#"{
  "filesCreated": ["string"],
  "filesModified": ["string"],
  "testsAdded": ["string"],
  "implementation": "string"
}"#
        }
        Role::Reviewer => {
            r#"{
  "approved": true,
  "issues": ["string"],
  "suggestions": ["string"],
  "summary": "string"
}"#
        }
    }
}

fn push_context(prompt: &mut String, context: &[ContextEntry]) {
    if context.is_empty() {
        return;
    }
    prompt.push_str("## Context\n\n");
    for entry in context {
        let _ = write!(prompt, "### {}\n{}\n\n", entry.label, entry.content.trim_end());
    }
}

/// Build the single-shot prompt for `role`.
///
/// Sections always appear in this order: system, task, requirements, output
/// format, custom instructions, context.
pub fn build_prompt(
    role: Role,
    description: &str,
    context: &[ContextEntry],
    custom_instructions: Option<&str>,
) -> String {
    let mut prompt = String::new();
    let _ = write!(prompt, "{}\n\n", system_prompt(role));
    let _ = write!(prompt, "## Task\n\n{}\n\n", description.trim());

    prompt.push_str("## Requirements\n\n");
    for req in requirements(role) {
        let _ = writeln!(prompt, "- {}", req);
    }
    prompt.push('\n');

    let _ = write!(
        prompt,
        "## Output Format\n\nRespond with a single JSON object matching this schema. \
         Do not include any other text.\n\n```json\n{}\n```\n\n",
        output_schema(role)
    );

    if let Some(custom) = custom_instructions.filter(|c| !c.trim().is_empty()) {
        let _ = write!(prompt, "## Additional Instructions\n\n{}\n\n", custom.trim());
    }

    push_context(&mut prompt, context);
    prompt.trim_end().to_string()
}

/// Build the prompt for a long-lived session that reports completion through
/// the `complete_task` action instead of its final stdout.
pub fn build_interactive_prompt(
    task_id: TaskId,
    role: Role,
    description: &str,
    context: &[ContextEntry],
) -> String {
    let mut prompt = String::new();
    let _ = write!(prompt, "{}\n\n", system_prompt(role));
    let _ = write!(prompt, "## Task {}\n\n{}\n\n", task_id, description.trim());

    prompt.push_str("## Requirements\n\n");
    for req in requirements(role) {
        let _ = writeln!(prompt, "- {}", req);
    }
    prompt.push_str("- Use your tools to read, edit and test the code.\n\n");

    let _ = write!(
        prompt,
        "## Completion\n\nWhen the work is finished, call the `{action}` action with \
         taskId {task_id} and a report containing:\n\
         - filesCreated: files you created\n\
         - filesModified: files you modified\n\
         - testsAdded: tests you added\n\
         - summary: what you did\n\
         - errors: problems you could not resolve\n\
         - nextSteps: follow-up work\n\n\
         The task is not complete until `{action}` is called.\n\n",
        action = COMPLETION_ACTION,
        task_id = task_id,
    );

    push_context(&mut prompt, context);
    prompt.trim_end().to_string()
}
