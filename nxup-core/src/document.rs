use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageJsonSection {
    #[serde(rename = "dependencies")]
    Dependencies,
    #[serde(rename = "devDependencies")]
    DevDependencies,
}

impl PackageJsonSection {
    pub fn key(&self) -> &'static str {
        match self {
            PackageJsonSection::Dependencies => "dependencies",
            PackageJsonSection::DevDependencies => "devDependencies",
        }
    }
}

/// One entry of the accumulating upgrade plan. `add_to_package_json` is the
/// collapsed tri-state: `None` mirrors the document literal `false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageUpdate {
    pub version: String,
    #[serde(default, deserialize_with = "section_or_flag")]
    pub add_to_package_json: Option<PackageJsonSection>,
}

impl PackageUpdate {
    pub fn new(version: impl Into<String>) -> Self {
        PackageUpdate {
            version: version.into(),
            add_to_package_json: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageGroupEntry {
    pub package: String,
    pub version: String,
}

/// Target of a `packageJsonUpdates` rule, as shipped in documents.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageUpdateTarget {
    pub version: String,
    #[serde(default)]
    pub always_add_to_package_json: bool,
    #[serde(default, deserialize_with = "section_or_flag")]
    pub add_to_package_json: Option<PackageJsonSection>,
    #[serde(default)]
    pub if_package_installed: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PackageJsonUpdate {
    pub version: String,
    #[serde(default)]
    pub packages: Option<IndexMap<String, PackageUpdateTarget>>,
    #[serde(default)]
    pub requires: IndexMap<String, String>,
    #[serde(default, rename = "x-prompt")]
    pub x_prompt: Option<String>,
}

/// A `packageJsonUpdates` rule after filtering: only surviving targets,
/// rewritten into plan records.
#[derive(Debug, Clone)]
pub struct FilteredPackageJsonUpdate {
    pub version: String,
    pub packages: IndexMap<String, PackageUpdate>,
    pub requires: IndexMap<String, String>,
    pub x_prompt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationGenerator {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub requires: IndexMap<String, String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub implementation: Option<String>,
    #[serde(default)]
    pub factory: Option<String>,
    #[serde(default)]
    pub cli: Option<String>,
}

/// The migrations file shipped inside a package tarball. The pre-generator
/// era called the section `schematics`; both spellings land in `generators`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMigrations {
    #[serde(default)]
    pub package_json_updates: IndexMap<String, PackageJsonUpdate>,
    #[serde(default, alias = "schematics")]
    pub generators: Option<IndexMap<String, MigrationGenerator>>,
}

/// Everything the fetcher learned about `package@version`.
#[derive(Debug, Clone, Default)]
pub struct MigrationDocument {
    pub version: String,
    pub package_group: Vec<PackageGroupEntry>,
    pub package_json_updates: IndexMap<String, PackageJsonUpdate>,
    pub generators: Option<IndexMap<String, MigrationGenerator>>,
}

impl MigrationDocument {
    pub fn bare(version: impl Into<String>) -> Self {
        MigrationDocument {
            version: version.into(),
            ..Default::default()
        }
    }
}

/// One entry of the emitted migrations file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationEntry {
    pub package: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub requires: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationsFile {
    pub migrations: Vec<MigrationEntry>,
}

/// `packageGroup` arrives in three historical shapes: a list of names, a
/// list of `{package, version}` objects, or a name-to-version map. All of
/// them normalize to the ordered entry list; names without a version mean
/// "same as the owning document".
pub fn normalize_package_group(value: &Value) -> Vec<PackageGroupEntry> {
    match value {
        Value::Array(entries) => entries
            .iter()
            .filter_map(|entry| match entry {
                Value::String(name) => Some(PackageGroupEntry {
                    package: name.clone(),
                    version: "*".to_string(),
                }),
                Value::Object(fields) => {
                    let package = fields.get("package").and_then(Value::as_str)?;
                    let version = fields.get("version").and_then(Value::as_str).unwrap_or("*");
                    Some(PackageGroupEntry {
                        package: package.to_string(),
                        version: version.to_string(),
                    })
                }
                _ => None,
            })
            .collect(),
        Value::Object(fields) => fields
            .iter()
            .filter_map(|(name, version)| {
                let version = version.as_str()?;
                Some(PackageGroupEntry {
                    package: name.clone(),
                    version: version.to_string(),
                })
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn section_or_flag<'de, D>(deserializer: D) -> Result<Option<PackageJsonSection>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Bool(false)) => Ok(None),
        Some(Value::Bool(true)) => Ok(Some(PackageJsonSection::Dependencies)),
        Some(Value::String(s)) if s == "dependencies" => Ok(Some(PackageJsonSection::Dependencies)),
        Some(Value::String(s)) if s == "devDependencies" => {
            Ok(Some(PackageJsonSection::DevDependencies))
        }
        Some(other) => Err(serde::de::Error::custom(format!(
            "invalid addToPackageJson value: {other}"
        ))),
    }
}
