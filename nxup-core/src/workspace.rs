use crate::{MigrateError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const WORKSPACE_CONFIG_FILE: &str = "nx.json";

/// The slice of the workspace configuration the migrate command cares
/// about: the self-managed installation block, when one is declared.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub installation: Option<InstallationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallationConfig {
    pub version: String,
    #[serde(default)]
    pub plugins: BTreeMap<String, String>,
}

impl WorkspaceConfig {
    pub fn load(root: &Path) -> Result<Option<Self>> {
        let path = config_path(root);
        if !path.is_file() {
            return Ok(None);
        }

        let data = fs::read_to_string(&path).map_err(|source| MigrateError::ReadFile {
            path: path.clone(),
            source,
        })?;

        let config: Self =
            serde_json::from_str(&data).map_err(|err| MigrateError::WorkspaceConfig {
                path: path.clone(),
                reason: err.to_string(),
            })?;

        Ok(Some(config))
    }
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(WORKSPACE_CONFIG_FILE)
}
