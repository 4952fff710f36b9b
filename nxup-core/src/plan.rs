use crate::document::{MigrationEntry, MigrationsFile, PackageUpdate};
use crate::installed::InstalledVersions;
use crate::manifest::JsonFile;
use crate::workspace;
use crate::{MigrateError, Result, version};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

pub const MIGRATIONS_FILE: &str = "migrations.json";

/// The project configuration split shipped in this version; workspaces
/// crossing it need the split migration before anything else.
const SPLIT_CONFIGURATION_VERSION: &str = "15.7.0-beta.0";

/// What the planner hands back: the transitive package-version plan and the
/// ordered list of migration scripts bringing source in step with it.
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    pub package_updates: IndexMap<String, PackageUpdate>,
    pub migrations: Vec<MigrationEntry>,
}

/// Persist the whole plan. Returns the number of migrations written, or
/// `None` when there was nothing to write.
pub fn write_plan(
    root: &Path,
    plan: &MigrationPlan,
    installed: &InstalledVersions,
) -> Result<Option<usize>> {
    update_manifest(root, plan)?;
    update_installation(root, plan)?;

    let migrations = build_migrations_list(plan, installed);
    if migrations.is_empty() {
        return Ok(None);
    }

    write_migrations_file(root, &migrations)?;
    Ok(Some(migrations.len()))
}

/// Rewrite dependency pins in `package.json`. A package already present
/// keeps its section; a new one is only inserted when the plan says which
/// section it belongs to. A missing manifest is not an error here.
pub fn update_manifest(root: &Path, plan: &MigrationPlan) -> Result<()> {
    let path = root.join("package.json");
    if !path.is_file() {
        return Ok(());
    }

    let mut file = JsonFile::read(&path)?;
    let Some(manifest) = file.value.as_object_mut() else {
        return Err(MigrateError::WorkspaceConfig {
            path,
            reason: "package.json is not a JSON object".to_string(),
        });
    };

    for (name, update) in &plan.package_updates {
        if section_contains(manifest, "devDependencies", name) {
            set_dependency(manifest, "devDependencies", name, &update.version);
        } else if section_contains(manifest, "dependencies", name) {
            set_dependency(manifest, "dependencies", name, &update.version);
        } else if let Some(section) = update.add_to_package_json {
            set_dependency(manifest, section.key(), name, &update.version);
        }
    }

    file.write()
}

/// Keep a self-managed installation block in step with the plan: the tool
/// version itself, plus any pinned plugins the plan also updates.
pub fn update_installation(root: &Path, plan: &MigrationPlan) -> Result<()> {
    let Some(config) = workspace::WorkspaceConfig::load(root)? else {
        return Ok(());
    };
    let Some(declared) = config.installation else {
        return Ok(());
    };

    let path = workspace::config_path(root);
    let mut file = JsonFile::read(&path)?;
    let Some(installation) = file
        .value
        .get_mut("installation")
        .and_then(Value::as_object_mut)
    else {
        return Ok(());
    };

    if let Some(update) = plan.package_updates.get("nx") {
        installation.insert(
            "version".to_string(),
            Value::String(update.version.clone()),
        );
    }

    if let Some(plugins) = installation.get_mut("plugins").and_then(Value::as_object_mut) {
        for name in declared.plugins.keys() {
            if let Some(update) = plan.package_updates.get(name) {
                plugins.insert(name.clone(), Value::String(update.version.clone()));
            }
        }
    }

    file.write()
}

/// The final ordered migrations list, with the hard-coded configuration
/// split migration prepended when the plan crosses that threshold.
pub fn build_migrations_list(
    plan: &MigrationPlan,
    installed: &InstalledVersions,
) -> Vec<MigrationEntry> {
    let mut migrations = Vec::with_capacity(plan.migrations.len() + 1);
    if let Some(entry) = split_configuration_migration(plan, installed) {
        migrations.push(entry);
    }
    migrations.extend(plan.migrations.iter().cloned());
    migrations
}

pub fn write_migrations_file(root: &Path, migrations: &[MigrationEntry]) -> Result<()> {
    let path = root.join(MIGRATIONS_FILE);
    let file = MigrationsFile {
        migrations: migrations.to_vec(),
    };

    let mut data =
        serde_json::to_string_pretty(&file).map_err(|e| MigrateError::SerializeJson {
            path: path.clone(),
            reason: e.to_string(),
        })?;
    data.push('\n');

    fs::write(&path, data).map_err(|source| MigrateError::WriteFile { path, source })
}

fn split_configuration_migration(
    plan: &MigrationPlan,
    installed: &InstalledVersions,
) -> Option<MigrationEntry> {
    let update = plan.package_updates.get("@nrwl/workspace")?;
    let installed_version = installed.get("@nrwl/workspace")?;

    if !version::lt(&installed_version, SPLIT_CONFIGURATION_VERSION)
        || !version::lte(SPLIT_CONFIGURATION_VERSION, &update.version)
    {
        return None;
    }

    Some(MigrationEntry {
        package: "@nrwl/workspace".to_string(),
        name: "15-7-0-split-configuration-into-project-json-files".to_string(),
        version: SPLIT_CONFIGURATION_VERSION.to_string(),
        description: None,
        cli: Some("nx".to_string()),
        implementation: Some(
            "./src/migrations/update-15-7-0/split-configuration-into-project-json-files"
                .to_string(),
        ),
        factory: None,
        requires: IndexMap::new(),
    })
}

fn section_contains(manifest: &Map<String, Value>, section: &str, name: &str) -> bool {
    manifest
        .get(section)
        .and_then(Value::as_object)
        .is_some_and(|deps| deps.contains_key(name))
}

fn set_dependency(manifest: &mut Map<String, Value>, section: &str, name: &str, version: &str) {
    let deps = manifest
        .entry(section.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(deps) = deps.as_object_mut() {
        deps.insert(name.to_string(), Value::String(version.to_string()));
    }
}
