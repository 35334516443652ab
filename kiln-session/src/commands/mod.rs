pub mod config;
pub mod deadlocks;
pub mod history;
pub mod init;
pub mod list;
pub mod run;
pub mod status;
pub mod submit;

use std::path::Path;

use anyhow::Context;

use kiln_session::config::{load_config, KilnConfig};
use kiln_session::db::Store;

/// Effective config (file plus `KILN_*` overrides) and an open store.
pub fn open(config_path: Option<&Path>) -> anyhow::Result<(KilnConfig, Store)> {
    let config = load_config(config_path)?.with_env_overrides();
    let db_path = config.db_path();
    let store = Store::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    Ok((config, store))
}

/// Shorten `s` to at most `max` characters for table output.
pub fn truncate(s: &str, max: usize) -> String {
    let first_line = s.lines().next().unwrap_or("");
    if first_line.chars().count() <= max {
        return first_line.to_string();
    }
    let kept: String = first_line.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}
