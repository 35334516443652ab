use std::path::Path;

use kiln_session::db::{audit, transitions};
use kiln_session::state::schema::{EntityType, Transition};

/// Transitions for one entity, or the most recent transitions overall.
pub fn transitions(
    config_path: Option<&Path>,
    entity: Option<(EntityType, String)>,
    limit: u32,
    json: bool,
) -> anyhow::Result<u8> {
    let (_config, store) = super::open(config_path)?;
    let rows: Vec<Transition> = store.call(|conn| match &entity {
        Some((entity_type, id)) => transitions::list_for_entity(conn, *entity_type, id),
        None => transitions::list_recent(conn, limit),
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(0);
    }
    if rows.is_empty() {
        println!("No transitions recorded.");
        return Ok(0);
    }
    for t in rows {
        println!(
            "{}  {} {}  {} -> {}  [{}]{}",
            t.created_at.format("%Y-%m-%d %H:%M:%S"),
            t.entity_type.as_str(),
            t.entity_id,
            t.from_state.as_deref().unwrap_or("-"),
            t.to_state,
            t.actor.as_str(),
            t.reason.map(|r| format!("  {}", r)).unwrap_or_default()
        );
    }
    Ok(0)
}

pub fn audit(config_path: Option<&Path>, limit: u32, json: bool) -> anyhow::Result<u8> {
    let (_config, store) = super::open(config_path)?;
    let entries = store.call(|conn| audit::list_recent(conn, limit))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(0);
    }
    for e in entries {
        let target = match (&e.entity_type, &e.entity_id) {
            (Some(t), Some(id)) => format!(" {} {}", t.as_str(), id),
            _ => String::new(),
        };
        println!("{}  {}{}", e.created_at.format("%Y-%m-%d %H:%M:%S"), e.action, target);
    }
    Ok(0)
}
