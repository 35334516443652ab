use std::path::Path;

use kiln_session::config::{config_path, load_config};

/// Print the effective configuration, env overrides applied.
pub fn show(path: Option<&Path>) -> anyhow::Result<u8> {
    let cfg = load_config(path)?.with_env_overrides();
    let output = serde_json::json!({
        "config_path": path.map(Path::to_path_buf).unwrap_or_else(config_path),
        "db_path": cfg.db_path(),
        "config": cfg,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(0)
}

pub fn path() -> anyhow::Result<u8> {
    println!("{}", config_path().display());
    Ok(0)
}
