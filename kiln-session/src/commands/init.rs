use std::path::Path;

pub fn run(config_path: Option<&Path>) -> anyhow::Result<u8> {
    let (config, _store) = super::open(config_path)?;
    println!("Database ready at {}", config.db_path().display());
    Ok(0)
}
