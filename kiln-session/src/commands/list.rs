use std::path::Path;

use kiln_session::db::features::{self, FeatureFilter};
use kiln_session::state::schema::Status;

use super::truncate;

pub fn run(config_path: Option<&Path>, status: Option<Status>, limit: u32, json: bool) -> anyhow::Result<u8> {
    let (_config, store) = super::open(config_path)?;
    let features = store.call(|conn| {
        features::find_all(
            conn,
            &FeatureFilter {
                status,
                limit: Some(limit),
                ..Default::default()
            },
        )
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&features)?);
        return Ok(0);
    }

    if features.is_empty() {
        println!("No features.");
        return Ok(0);
    }

    println!("{:<38} {:<12} {:<9} {}", "FEATURE", "STATUS", "PRIORITY", "DESCRIPTION");
    println!("{}", "-".repeat(100));
    for f in features {
        println!(
            "{:<38} {:<12} {:<9} {}",
            f.id,
            f.status,
            f.priority.as_str(),
            truncate(&f.description, 40)
        );
    }
    Ok(0)
}
