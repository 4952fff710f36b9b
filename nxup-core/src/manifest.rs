use crate::{MigrateError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
}

impl Manifest {
    pub fn read(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(MigrateError::ManifestMissing {
                path: path.to_path_buf(),
            });
        }

        let data = fs::read_to_string(path).map_err(|source| MigrateError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&data).map_err(|source| MigrateError::ParseJson {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn has_dependency(&self, name: &str) -> bool {
        self.dependencies.contains_key(name) || self.dev_dependencies.contains_key(name)
    }
}

/// A JSON file edited in place. Key order and the presence of a trailing
/// newline survive the round trip.
#[derive(Debug)]
pub struct JsonFile {
    pub path: PathBuf,
    pub value: Value,
    trailing_newline: bool,
}

impl JsonFile {
    pub fn read(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|source| MigrateError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        let value = serde_json::from_str(&data).map_err(|source| MigrateError::ParseJson {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(JsonFile {
            path: path.to_path_buf(),
            value,
            trailing_newline: data.ends_with('\n'),
        })
    }

    pub fn write(&self) -> Result<()> {
        let mut data =
            serde_json::to_string_pretty(&self.value).map_err(|e| MigrateError::SerializeJson {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        if self.trailing_newline {
            data.push('\n');
        }

        fs::write(&self.path, data).map_err(|source| MigrateError::WriteFile {
            path: self.path.clone(),
            source,
        })
    }
}

/// Serialized `(dependencies, devDependencies)` pair, used by the runner to
/// detect whether migrations changed the dependency set.
pub fn dependency_snapshot(manifest_path: &Path) -> Result<String> {
    let manifest = Manifest::read(manifest_path)?;
    serde_json::to_string(&(&manifest.dependencies, &manifest.dev_dependencies)).map_err(|e| {
        MigrateError::SerializeJson {
            path: manifest_path.to_path_buf(),
            reason: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(tag: &str) -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("nxup_{}_{}", tag, timestamp));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn reads_manifest_sections() {
        let dir = temp_dir("manifest");
        let path = dir.join("package.json");
        fs::write(
            &path,
            r#"{"name":"demo","dependencies":{"a":"1.0.0"},"devDependencies":{"b":"2.0.0"}}"#,
        )
        .unwrap();

        let manifest = Manifest::read(&path).unwrap();
        assert!(manifest.has_dependency("a"));
        assert!(manifest.has_dependency("b"));
        assert!(!manifest.has_dependency("c"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn json_file_preserves_trailing_newline() {
        let dir = temp_dir("jsonfile");

        let with_newline = dir.join("with.json");
        fs::write(&with_newline, "{\n  \"a\": 1\n}\n").unwrap();
        let file = JsonFile::read(&with_newline).unwrap();
        file.write().unwrap();
        assert!(fs::read_to_string(&with_newline).unwrap().ends_with("}\n"));

        let without_newline = dir.join("without.json");
        fs::write(&without_newline, "{\n  \"a\": 1\n}").unwrap();
        let file = JsonFile::read(&without_newline).unwrap();
        file.write().unwrap();
        assert!(fs::read_to_string(&without_newline).unwrap().ends_with('}'));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn json_file_preserves_key_order() {
        let dir = temp_dir("order");
        let path = dir.join("package.json");
        fs::write(&path, "{\n  \"zeta\": 1,\n  \"alpha\": 2\n}\n").unwrap();

        let file = JsonFile::read(&path).unwrap();
        file.write().unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.find("zeta").unwrap() < written.find("alpha").unwrap());

        fs::remove_dir_all(&dir).unwrap();
    }
}
