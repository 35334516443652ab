use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use kiln_session::config::{config_path, load_config, KilnConfig};

const DEFAULT_HTTP_PORT: u16 = 7842;

/// Daemon configuration: the shared kiln config plus daemon-only settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub kiln: KilnConfig,
    pub http_port: u16,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct DaemonSection {
    http_port: Option<u16>,
}

/// The `[daemon]` table of the shared config file. Other tables belong to
/// `KilnConfig` and are ignored here.
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    daemon: Option<DaemonSection>,
}

impl DaemonConfig {
    /// Load configuration from file and environment variables.
    ///
    /// `KILN_*` environment variables override file values. A missing default
    /// file yields defaults; a missing explicit path is an error.
    pub fn load(config_path_override: Option<&PathBuf>) -> Result<Self> {
        let kiln = load_config(config_path_override.map(PathBuf::as_path))?.with_env_overrides();

        let path = config_path_override.cloned().unwrap_or_else(config_path);
        let file_config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            toml::from_str::<ConfigFile>(&content)
                .with_context(|| format!("failed to parse config: {}", path.display()))?
        } else {
            ConfigFile::default()
        };

        Self::from_file_and_env(kiln, file_config)
    }

    fn from_file_and_env(kiln: KilnConfig, file_config: ConfigFile) -> Result<Self> {
        let resolved_http_port = std::env::var("KILN_HTTP_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .or_else(|| file_config.daemon.and_then(|d| d.http_port))
            .unwrap_or(DEFAULT_HTTP_PORT);

        Self::build(kiln, resolved_http_port)
    }

    /// Build config from resolved values (after file + env merging).
    fn build(kiln: KilnConfig, http_port: u16) -> Result<Self> {
        if http_port == 0 {
            bail!("http_port must be greater than 0 (set [daemon] http_port or KILN_HTTP_PORT)");
        }
        kiln.validate()?;
        Ok(Self { kiln, http_port })
    }
}
