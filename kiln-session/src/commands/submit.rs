use std::path::Path;
use std::sync::Arc;

use anyhow::bail;

use kiln_session::db::features::NewFeature;
use kiln_session::exec::{CompletionRegistry, TokioLauncher};
use kiln_session::scheduler::{Scheduler, Submission};
use kiln_session::state::schema::Priority;

pub fn run(
    config_path: Option<&Path>,
    description: &str,
    priority: Priority,
    json: bool,
) -> anyhow::Result<u8> {
    if description.trim().is_empty() {
        bail!("description must not be empty");
    }
    let (config, store) = super::open(config_path)?;

    // Submitting only touches the store; nothing is dispatched here.
    let scheduler = Scheduler::from_config(store, &config, Arc::new(TokioLauncher), CompletionRegistry::new());
    let submission = scheduler.submit_feature(NewFeature {
        description: description.to_string(),
        priority,
        ..Default::default()
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&submission)?);
    } else {
        print_submission(&submission);
    }
    Ok(0)
}

fn print_submission(submission: &Submission) {
    println!("Feature {} submitted", submission.feature.id);
    if let Some(task) = &submission.task {
        println!("  task {} ({}) pending", task.id, task.role);
    }
}
