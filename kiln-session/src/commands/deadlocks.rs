use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use kiln_session::deadlock::{detect_deadlocks, DeadlockMonitor, RegexExtractor, WorkItem};
use kiln_session::reasoning::RuleBasedReasoner;

fn load_items(path: &Path) -> anyhow::Result<Vec<WorkItem>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read work items: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse work items: {}", path.display()))
}

/// Report deadlocks in a JSON array of work items. Exits 1 when any are found.
pub fn detect(items_path: &Path, json: bool) -> anyhow::Result<u8> {
    let items = load_items(items_path)?;
    let found = detect_deadlocks(&items, &RegexExtractor);

    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
    } else if found.is_empty() {
        println!("No deadlocks among {} item(s).", items.len());
    } else {
        for d in &found {
            println!("[{}] {}", d.kind, d.description);
        }
    }
    Ok(if found.is_empty() { 0 } else { 1 })
}

/// Detect, resolve with the rule-based reasoner, and print the updated items.
pub fn resolve(items_path: &Path, json: bool) -> anyhow::Result<u8> {
    let mut items = load_items(items_path)?;
    let mut monitor = DeadlockMonitor::new(Box::new(RegexExtractor), Arc::new(RuleBasedReasoner));

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let resolutions = runtime.block_on(monitor.scan(&mut items));

    if json {
        let output = serde_json::json!({
            "resolutions": resolutions,
            "items": items,
            "stats": monitor.stats(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(0);
    }

    if resolutions.is_empty() {
        println!("No deadlocks among {} item(s).", items.len());
        return Ok(0);
    }
    for r in &resolutions {
        let action = r
            .decision
            .as_ref()
            .map(|d| match d.target_id {
                Some(id) => format!("{} #{}", d.action, id),
                None => d.action.to_string(),
            })
            .unwrap_or_else(|| "no decision".to_string());
        println!(
            "[{}] {} => {}{}",
            r.deadlock.kind,
            r.deadlock.description,
            action,
            if r.resolved { "" } else { " (unresolved)" }
        );
    }
    let stats = monitor.stats();
    println!("{} detected, {} resolved", stats.detected, stats.resolved);
    Ok(0)
}
