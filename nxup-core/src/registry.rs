use crate::document::{MigrationDocument, PackageGroupEntry, RawMigrations, normalize_package_group};
use crate::{MigrateConfig, MigrateError, Result, console};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use indexmap::IndexMap;
use nxup_semver::RangeSet;
use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderValue};
use semver::Version;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use tar::Archive;
use tempfile::TempDir;
use tokio::sync::Semaphore;

const REGISTRY_CONCURRENCY: usize = 16;

#[derive(Clone, Debug, Deserialize)]
pub struct RegistryPackument {
    #[serde(default)]
    pub versions: IndexMap<String, RegistryVersion>,
    #[serde(default, rename = "dist-tags")]
    pub dist_tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RegistryVersion {
    pub version: String,
    #[serde(default)]
    pub dist: Option<RegistryDist>,
    #[serde(default, rename = "nx-migrations")]
    pub nx_migrations: Option<Value>,
    #[serde(default, rename = "ng-update")]
    pub ng_update: Option<Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RegistryDist {
    pub tarball: String,
}

/// The migration pointer a published version carries in its manifest:
/// where the migrations file lives inside the tarball, and which sibling
/// packages ride along.
#[derive(Clone, Debug, Default)]
pub struct MigrationMeta {
    pub migrations_path: Option<String>,
    pub package_group: Vec<PackageGroupEntry>,
}

/// Result of the install-based fallback path.
#[derive(Debug)]
pub struct InstalledMigrations {
    pub version: String,
    pub meta: Option<MigrationMeta>,
    pub migrations: Option<RawMigrations>,
}

/// The registry primitives the fetcher is built on. Everything is async
/// and opaque; the planner never talks to this directly.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn resolve_version(&self, name: &str, range: &str) -> Result<String>;

    async fn migration_meta(&self, name: &str, version: &str) -> Result<Option<MigrationMeta>>;

    async fn fetch_migrations(
        &self,
        name: &str,
        version: &str,
        migrations_path: &str,
    ) -> Result<RawMigrations>;

    async fn install_migrations(&self, name: &str, version: &str) -> Result<InstalledMigrations>;
}

pub struct HttpRegistry {
    config: MigrateConfig,
    client: Client,
    packuments: Mutex<BTreeMap<String, Arc<RegistryPackument>>>,
    requests: Semaphore,
}

impl HttpRegistry {
    pub fn new(config: MigrateConfig) -> Self {
        HttpRegistry {
            config,
            client: Client::new(),
            packuments: Mutex::new(BTreeMap::new()),
            requests: Semaphore::new(REGISTRY_CONCURRENCY),
        }
    }

    async fn packument(&self, name: &str) -> Result<Arc<RegistryPackument>> {
        {
            let cache = self.packuments.lock().unwrap();
            if let Some(packument) = cache.get(name) {
                return Ok(packument.clone());
            }
        }

        let _permit = self.requests.acquire().await.unwrap();
        let encoded = encode_package_name(name);
        let url = format!(
            "{}/{}",
            self.config.default_registry.trim_end_matches('/'),
            encoded
        );

        let mut request = self.client.get(&url);
        request = request.header(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.config.auth_token {
            request = request.header("authorization", format!("Bearer {}", token));
        }

        console::verbose(&format!("registry request: name={} url={}", name, url));

        let response = request.send().await.map_err(|source| MigrateError::Http {
            url: url.clone(),
            source,
        })?;

        let packument = response
            .error_for_status()
            .map_err(|source| MigrateError::Http {
                url: url.clone(),
                source,
            })?
            .json::<RegistryPackument>()
            .await
            .map_err(|source| MigrateError::Http {
                url: url.clone(),
                source,
            })?;

        console::verbose(&format!(
            "registry response: name={} versions={} dist_tags={}",
            name,
            packument.versions.len(),
            packument.dist_tags.len()
        ));

        let packument = Arc::new(packument);
        self.packuments
            .lock()
            .unwrap()
            .insert(name.to_string(), packument.clone());
        Ok(packument)
    }

    async fn download_package(&self, name: &str, version: &str) -> Result<(TempDir, PathBuf)> {
        let packument = self.packument(name).await?;
        let tarball = packument
            .versions
            .get(version)
            .and_then(|v| v.dist.as_ref())
            .map(|dist| dist.tarball.clone())
            .ok_or_else(|| MigrateError::ResolutionFailed {
                name: name.to_string(),
                range: version.to_string(),
                reason: "version has no tarball".to_string(),
            })?;

        let scratch = TempDir::new().map_err(|source| MigrateError::Io {
            path: std::env::temp_dir(),
            source,
        })?;

        let _permit = self.requests.acquire().await.unwrap();
        let mut request = self.client.get(&tarball);
        if let Some(token) = &self.config.auth_token {
            request = request.header("authorization", format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(|source| MigrateError::Http {
            url: tarball.clone(),
            source,
        })?;

        let bytes = response
            .error_for_status()
            .map_err(|source| MigrateError::Http {
                url: tarball.clone(),
                source,
            })?
            .bytes()
            .await
            .map_err(|source| MigrateError::Http {
                url: tarball.clone(),
                source,
            })?;

        let dir = scratch.path().to_path_buf();
        unpack_tarball(&dir, bytes.to_vec())?;

        let root = package_root_dir(&dir);
        Ok((scratch, root))
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn resolve_version(&self, name: &str, range: &str) -> Result<String> {
        let packument = self.packument(name).await?;
        let trimmed = range.trim();

        if let Some(tag_version) = packument.dist_tags.get(trimmed) {
            return Ok(tag_version.clone());
        }

        if packument.versions.contains_key(trimmed) {
            return Ok(trimmed.to_string());
        }

        let ranges = RangeSet::parse(trimmed).map_err(|err| MigrateError::Semver {
            value: format!("{}@{}", name, trimmed),
            reason: err.to_string(),
        })?;

        let mut selected: Option<Version> = None;
        for version_str in packument.versions.keys() {
            if let Ok(version) = Version::parse(version_str) {
                if !ranges.matches(&version) {
                    continue;
                }
                match &selected {
                    Some(best) if version <= *best => {}
                    _ => selected = Some(version),
                }
            }
        }

        match selected {
            Some(version) => Ok(version.to_string()),
            None => Err(MigrateError::ResolutionFailed {
                name: name.to_string(),
                range: range.to_string(),
                reason: "no published version satisfies the requested range".to_string(),
            }),
        }
    }

    async fn migration_meta(&self, name: &str, version: &str) -> Result<Option<MigrationMeta>> {
        let packument = self.packument(name).await?;
        let Some(version_meta) = packument.versions.get(version) else {
            return Ok(None);
        };

        let config = version_meta
            .nx_migrations
            .as_ref()
            .or(version_meta.ng_update.as_ref());

        Ok(config.map(parse_migration_meta))
    }

    async fn fetch_migrations(
        &self,
        name: &str,
        version: &str,
        migrations_path: &str,
    ) -> Result<RawMigrations> {
        let (_scratch, package_root) = self.download_package(name, version).await?;
        read_migrations_file(&package_root, migrations_path).map_err(|err| {
            MigrateError::MigrationsUnavailable {
                package: name.to_string(),
                version: version.to_string(),
                reason: err.to_string(),
            }
        })
    }

    async fn install_migrations(&self, name: &str, version: &str) -> Result<InstalledMigrations> {
        let scratch = TempDir::new().map_err(|source| MigrateError::Io {
            path: std::env::temp_dir(),
            source,
        })?;

        fs::write(scratch.path().join("package.json"), "{}\n").map_err(|source| {
            MigrateError::WriteFile {
                path: scratch.path().join("package.json"),
                source,
            }
        })?;

        let spec = format!("{}@{}", name, version);
        console::verbose(&format!(
            "registry fallback: installing {} into {}",
            spec,
            scratch.path().display()
        ));

        let command = format!("npm install {} --ignore-scripts --no-audit --no-fund", spec);
        let output = Command::new("npm")
            .arg("install")
            .arg(&spec)
            .arg("--ignore-scripts")
            .arg("--no-audit")
            .arg("--no-fund")
            .arg("--registry")
            .arg(&self.config.default_registry)
            .current_dir(scratch.path())
            .output()
            .map_err(|source| MigrateError::Io {
                path: scratch.path().to_path_buf(),
                source,
            })?;

        if !output.status.success() {
            return Err(MigrateError::InstallFailed {
                command,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let package_root = scratch.path().join("node_modules").join(name);
        let manifest_path = package_root.join("package.json");
        let data = fs::read_to_string(&manifest_path).map_err(|source| MigrateError::ReadFile {
            path: manifest_path.clone(),
            source,
        })?;
        let manifest: Value =
            serde_json::from_str(&data).map_err(|source| MigrateError::ParseJson {
                path: manifest_path.clone(),
                source,
            })?;

        let installed_version = manifest
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or(version)
            .to_string();

        let meta = manifest
            .get("nx-migrations")
            .or_else(|| manifest.get("ng-update"))
            .map(parse_migration_meta);

        let migrations = match meta.as_ref().and_then(|m| m.migrations_path.as_deref()) {
            Some(path) => Some(read_migrations_file(&package_root, path).map_err(|err| {
                MigrateError::MigrationsUnavailable {
                    package: name.to_string(),
                    version: installed_version.clone(),
                    reason: err.to_string(),
                }
            })?),
            None => None,
        };

        Ok(InstalledMigrations {
            version: installed_version,
            meta,
            migrations,
        })
    }
}

pub fn parse_migration_meta(value: &Value) -> MigrationMeta {
    match value {
        Value::String(path) => MigrationMeta {
            migrations_path: Some(path.clone()),
            package_group: Vec::new(),
        },
        Value::Object(fields) => MigrationMeta {
            migrations_path: fields
                .get("migrations")
                .and_then(Value::as_str)
                .map(str::to_string),
            package_group: fields
                .get("packageGroup")
                .map(normalize_package_group)
                .unwrap_or_default(),
        },
        _ => MigrationMeta::default(),
    }
}

/// Assemble a migration document from the meta pointer and the parsed
/// migrations file, the same way for the registry and the install paths.
pub fn assemble_document(
    version: String,
    meta: Option<MigrationMeta>,
    migrations: Option<RawMigrations>,
) -> MigrationDocument {
    let package_group = meta.map(|m| m.package_group).unwrap_or_default();
    match migrations {
        Some(raw) => MigrationDocument {
            version,
            package_group,
            package_json_updates: raw.package_json_updates,
            generators: raw.generators,
        },
        None => MigrationDocument {
            version,
            package_group,
            ..Default::default()
        },
    }
}

fn read_migrations_file(package_root: &Path, migrations_path: &str) -> std::io::Result<RawMigrations> {
    let relative = migrations_path.trim_start_matches("./");
    let path = package_root.join(relative);
    let data = fs::read_to_string(&path)?;
    serde_json::from_str(&data).map_err(std::io::Error::other)
}

fn encode_package_name(name: &str) -> String {
    if name.starts_with('@') {
        name.replace('/', "%2F")
    } else {
        name.to_string()
    }
}

fn package_root_dir(dir: &Path) -> PathBuf {
    let candidate = dir.join("package");
    if candidate.is_dir() {
        candidate
    } else {
        dir.to_path_buf()
    }
}

fn unpack_tarball(dir: &Path, data: Vec<u8>) -> Result<()> {
    let cursor = Cursor::new(data);
    let decoder = GzDecoder::new(cursor);
    let mut archive = Archive::new(decoder);

    archive.unpack(dir).map_err(|source| MigrateError::Archive {
        path: dir.to_path_buf(),
        source,
    })?;

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_string_migration_meta() {
        let meta = parse_migration_meta(&json!("./migrations.json"));
        assert_eq!(meta.migrations_path.as_deref(), Some("./migrations.json"));
        assert!(meta.package_group.is_empty());
    }

    #[test]
    fn parses_object_migration_meta() {
        let meta = parse_migration_meta(&json!({
            "migrations": "./migrations.json",
            "packageGroup": ["a", { "package": "b", "version": "2.0.0" }]
        }));
        assert_eq!(meta.migrations_path.as_deref(), Some("./migrations.json"));
        assert_eq!(meta.package_group.len(), 2);
        assert_eq!(meta.package_group[0].version, "*");
    }

    #[test]
    fn assembles_bare_document_without_migrations() {
        let doc = assemble_document("2.0.0".to_string(), None, None);
        assert_eq!(doc.version, "2.0.0");
        assert!(doc.package_group.is_empty());
        assert!(doc.generators.is_none());
        assert!(doc.package_json_updates.is_empty());
    }

    #[test]
    fn encodes_scoped_names() {
        assert_eq!(encode_package_name("@nrwl/workspace"), "@nrwl%2Fworkspace");
        assert_eq!(encode_package_name("left-pad"), "left-pad");
    }
}
