use std::path::Path;

use kiln_session::db::{features, tasks};
use kiln_session::error::KilnError;

use super::truncate;

pub fn run(config_path: Option<&Path>, feature_id: &str, json: bool) -> anyhow::Result<u8> {
    let (_config, store) = super::open(config_path)?;
    let (feature, tasks) = store.call(|conn| {
        let feature = features::find_by_id(conn, feature_id)?;
        let tasks = tasks::list_by_feature(conn, feature_id)?;
        Ok((feature, tasks))
    })?;
    let feature = feature.ok_or_else(|| KilnError::FeatureNotFound(feature_id.to_string()))?;

    if json {
        let output = serde_json::json!({
            "feature": feature,
            "tasks": tasks,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(0);
    }

    println!("Feature:  {}", feature.id);
    println!("Status:   {}", feature.status);
    println!("Priority: {}", feature.priority.as_str());
    println!("{}", feature.description);
    println!();

    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(0);
    }
    println!("{:<6} {:<10} {:<12} {:<8} {}", "TASK", "ROLE", "STATUS", "ATTEMPTS", "DESCRIPTION");
    for t in &tasks {
        println!(
            "{:<6} {:<10} {:<12} {:<8} {}",
            t.id,
            t.role,
            t.status,
            t.attempts,
            truncate(&t.description, 50)
        );
        if let Some(error) = &t.error {
            println!("       error: {}", truncate(error, 70));
        }
    }
    Ok(0)
}
