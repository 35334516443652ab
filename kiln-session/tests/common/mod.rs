use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::cargo::CommandCargoExt;
use tempfile::TempDir;

/// A scratch config and database for one test.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("kiln.db");
        std::fs::write(
            dir.path().join("config.toml"),
            format!("db_path = {:?}\n", db.to_string_lossy()),
        )
        .unwrap();
        Self { dir }
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("config.toml")
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// `kiln-session --config <scratch config>` with no `KILN_*` overrides.
    pub fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("kiln-session").unwrap();
        cmd.arg("--config")
            .arg(self.config_path())
            .env_remove("KILN_DB_PATH")
            .env_remove("KILN_CLAUDE_BIN");
        cmd
    }
}
