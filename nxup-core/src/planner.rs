use crate::document::{
    FilteredPackageJsonUpdate, MigrationDocument, MigrationEntry, MigrationGenerator,
    PackageGroupEntry, PackageJsonSection, PackageJsonUpdate, PackageUpdate, PackageUpdateTarget,
};
use crate::fetch::Fetcher;
use crate::installed::InstalledVersions;
use crate::manifest::Manifest;
use crate::plan::MigrationPlan;
use crate::{MigrateError, Result, console, version};
use async_recursion::async_recursion;
use futures::future::join_all;
use indexmap::IndexMap;
use semver::Version;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Versions below this threshold predate the `nx` package; a bare version
/// on the command line picks its target package accordingly.
const PACKAGE_SPLIT_VERSION: &str = "14.0.0-beta.0";

/// Decides `x-prompt` gates under `--interactive`.
pub trait UpdatePrompt: Send + Sync {
    fn confirm(&self, message: &str) -> Result<bool>;
}

pub struct ConsolePrompt;

impl UpdatePrompt for ConsolePrompt {
    fn confirm(&self, message: &str) -> Result<bool> {
        console::confirm(message).map_err(|source| MigrateError::Io {
            path: PathBuf::from("stdin"),
            source,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MigratorOptions {
    pub to: BTreeMap<String, String>,
    pub interactive: bool,
    pub exclude_applied_migrations: bool,
}

/// The planner. Consumes the manifest once, accumulates the package-update
/// plan while recursing through migration documents, then derives the
/// ordered migrations list. One instance per invocation.
pub struct Migrator {
    fetcher: Fetcher,
    installed: InstalledVersions,
    manifest: Manifest,
    options: MigratorOptions,
    prompt: Box<dyn UpdatePrompt>,
    package_updates: Mutex<IndexMap<String, PackageUpdate>>,
    collected_versions: Mutex<BTreeMap<String, String>>,
}

struct DeferredPackageUpdates {
    package: String,
    updates: Vec<FilteredPackageJsonUpdate>,
}

impl Migrator {
    pub fn new(
        fetcher: Fetcher,
        installed: InstalledVersions,
        manifest: Manifest,
        options: MigratorOptions,
    ) -> Self {
        Migrator {
            fetcher,
            installed,
            manifest,
            options,
            prompt: Box::new(ConsolePrompt),
            package_updates: Mutex::new(IndexMap::new()),
            collected_versions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_prompt(mut self, prompt: Box<dyn UpdatePrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub async fn migrate(&self, target_package: &str, target_version: &str) -> Result<MigrationPlan> {
        self.build_package_json_updates(
            target_package.to_string(),
            PackageUpdate::new(target_version),
        )
        .await?;

        let migrations = self.create_migrations().await?;
        let package_updates = self.package_updates.lock().unwrap().clone();

        Ok(MigrationPlan {
            package_updates,
            migrations,
        })
    }

    pub fn installed_version(&self, package: &str) -> Option<String> {
        self.installed.get(package)
    }

    pub fn installed(&self) -> &InstalledVersions {
        &self.installed
    }

    // Phase 1.

    #[async_recursion]
    async fn build_package_json_updates(&self, package: String, target: PackageUpdate) -> Result<()> {
        let to_check = self.populate_package_json_updates(package, target).await?;

        for deferred in to_check {
            let mut confirmed: IndexMap<String, PackageUpdate> = IndexMap::new();

            // Updates are weighed in document order; packages admitted by an
            // earlier update are visible to the `requires` of a later one.
            for update in &deferred.updates {
                if !self.are_requirements_met(&update.requires, Some(&confirmed)) {
                    continue;
                }
                if self.options.interactive
                    && let Some(question) = &update.x_prompt
                    && !self.prompt.confirm(question)?
                {
                    continue;
                }
                for (name, record) in &update.packages {
                    confirmed.insert(name.clone(), record.clone());
                }
            }

            let results = join_all(
                confirmed
                    .into_iter()
                    .map(|(name, record)| self.build_package_json_updates(name, record)),
            )
            .await;
            for result in results {
                result?;
            }
        }

        Ok(())
    }

    #[async_recursion]
    async fn populate_package_json_updates(
        &self,
        package: String,
        target: PackageUpdate,
    ) -> Result<Vec<DeferredPackageUpdates>> {
        let target_version = match self.options.to.get(&package) {
            Some(version) => version.clone(),
            None => target.version.clone(),
        };

        // A package that is not installed gets a plan entry and nothing
        // else; it brings no transitive children.
        if self.installed_version(&package).is_none() {
            self.add_package_update(
                &package,
                PackageUpdate {
                    version: target.version.clone(),
                    add_to_package_json: target.add_to_package_json,
                },
            );
            return Ok(Vec::new());
        }

        let document = match self.fetcher.fetch(&package, &target_version).await {
            Ok(document) => document,
            Err(err) => {
                let message = err.to_string();
                if message.contains("No matching version") {
                    return Err(MigrateError::InvalidTargetVersion { message });
                }
                return Err(err);
            }
        };

        // The registry may have resolved a range or tag to something else.
        let target_version = document.version.clone();

        {
            let mut collected = self.collected_versions.lock().unwrap();
            if let Some(existing) = collected.get(&package)
                && version::gte(existing, &target_version)
            {
                return Ok(Vec::new());
            }
            collected.insert(package.clone(), target_version.clone());
        }

        self.add_package_update(
            &package,
            PackageUpdate {
                version: target_version.clone(),
                add_to_package_json: target.add_to_package_json,
            },
        );

        let (updates, group_order) =
            self.updates_from_document(&package, &target_version, &document);

        if updates.is_empty() {
            return Ok(Vec::new());
        }

        let needs_check = updates.iter().any(|update| {
            (self.options.interactive && update.x_prompt.is_some()) || !update.requires.is_empty()
        });
        if needs_check {
            return Ok(vec![DeferredPackageUpdates { package, updates }]);
        }

        let mut to_apply: IndexMap<String, PackageUpdate> = IndexMap::new();
        for update in updates {
            for (name, record) in update.packages {
                to_apply.insert(name, record);
            }
        }

        let results = join_all(
            to_apply
                .into_iter()
                .map(|(name, record)| self.populate_package_json_updates(name, record)),
        )
        .await;

        let mut deferred = Vec::new();
        for result in results {
            deferred.extend(result?);
        }

        // Downstream visits follow the precedence the package group declares.
        deferred.sort_by_key(|item| {
            group_order
                .iter()
                .position(|name| name == &item.package)
                .map(|index| index as isize)
                .unwrap_or(-1)
        });

        Ok(deferred)
    }

    /// Expand the package group into a synthetic trailing update, then
    /// filter everything down to what applies between the installed and the
    /// target version.
    fn updates_from_document(
        &self,
        package: &str,
        target_version: &str,
        document: &MigrationDocument,
    ) -> (Vec<FilteredPackageJsonUpdate>, Vec<String>) {
        let group = if package == "@nrwl/workspace"
            && version::lt(target_version, PACKAGE_SPLIT_VERSION)
        {
            legacy_workspace_group()
        } else {
            document.package_group.clone()
        };

        let mut updates = document.package_json_updates.clone();
        let mut group_order = Vec::with_capacity(group.len());

        if !group.is_empty() {
            let mut packages: IndexMap<String, PackageUpdateTarget> = IndexMap::new();
            for entry in &group {
                group_order.push(entry.package.clone());
                let child_version = if entry.version == "*" {
                    // A pinned parent pins its same-cadence siblings too.
                    if let Some(pinned) = self.installed.override_for(package) {
                        self.installed.add_override(&entry.package, pinned);
                    }
                    target_version.to_string()
                } else {
                    entry.version.clone()
                };
                packages.insert(
                    entry.package.clone(),
                    PackageUpdateTarget {
                        version: child_version,
                        always_add_to_package_json: false,
                        add_to_package_json: None,
                        if_package_installed: None,
                    },
                );
            }

            updates.insert(
                format!("{target_version}--PackageGroup"),
                PackageJsonUpdate {
                    version: target_version.to_string(),
                    packages: Some(packages),
                    requires: IndexMap::new(),
                    x_prompt: None,
                },
            );
        }

        (
            self.filter_package_json_updates(updates, package, target_version),
            group_order,
        )
    }

    fn filter_package_json_updates(
        &self,
        updates: IndexMap<String, PackageJsonUpdate>,
        package: &str,
        target_version: &str,
    ) -> Vec<FilteredPackageJsonUpdate> {
        let Some(installed_version) = self.installed_version(package) else {
            return Vec::new();
        };

        let mut filtered = Vec::new();

        for (_, update) in updates {
            let Some(packages) = update.packages else {
                continue;
            };
            // Updates for versions already passed, or beyond the target,
            // do not apply. An update at exactly the target is admitted.
            if !version::gt(&update.version, &installed_version)
                || version::gt(&update.version, target_version)
            {
                continue;
            }

            let mut surviving: IndexMap<String, PackageUpdate> = IndexMap::new();

            for (name, child) in packages {
                if let Some(guard) = &child.if_package_installed
                    && self.installed_version(guard).is_none()
                {
                    continue;
                }
                if !(child.always_add_to_package_json
                    || child.add_to_package_json.is_some()
                    || self.manifest.has_dependency(&name))
                {
                    continue;
                }
                {
                    let collected = self.collected_versions.lock().unwrap();
                    if let Some(existing) = collected.get(&name)
                        && !version::gt(&child.version, existing)
                    {
                        continue;
                    }
                }

                let section = if child.always_add_to_package_json {
                    Some(PackageJsonSection::Dependencies)
                } else {
                    child.add_to_package_json
                };
                surviving.insert(
                    name,
                    PackageUpdate {
                        version: child.version,
                        add_to_package_json: section,
                    },
                );
            }

            if surviving.is_empty() {
                continue;
            }

            filtered.push(FilteredPackageJsonUpdate {
                version: update.version,
                packages: surviving,
                requires: update.requires,
                x_prompt: update.x_prompt,
            });
        }

        filtered
    }

    fn add_package_update(&self, package: &str, update: PackageUpdate) {
        let mut updates = self.package_updates.lock().unwrap();
        match updates.get(package) {
            Some(existing) if !version::gt(&update.version, &existing.version) => {}
            _ => {
                updates.insert(package.to_string(), update);
            }
        }
    }

    fn are_requirements_met(
        &self,
        requires: &IndexMap<String, String>,
        pending: Option<&IndexMap<String, PackageUpdate>>,
    ) -> bool {
        if requires.is_empty() {
            return true;
        }

        requires.iter().all(|(name, range)| {
            {
                let updates = self.package_updates.lock().unwrap();
                if let Some(update) = updates.get(name) {
                    return version::satisfies(&version::clean_semver(&update.version), range);
                }
            }
            if let Some(pending) = pending
                && let Some(update) = pending.get(name)
            {
                return version::satisfies(&version::clean_semver(&update.version), range);
            }
            match self.installed_version(name) {
                Some(installed) => version::satisfies(&installed, range),
                None => false,
            }
        })
    }

    // Phase 2.

    async fn create_migrations(&self) -> Result<Vec<MigrationEntry>> {
        let planned: Vec<(String, PackageUpdate)> = {
            let updates = self.package_updates.lock().unwrap();
            updates
                .iter()
                .map(|(name, update)| (name.clone(), update.clone()))
                .collect()
        };

        let results = join_all(planned.into_iter().map(|(package, update)| async move {
            let Some(installed_version) = self.installed_version(&package) else {
                return Ok(Vec::new());
            };

            let document = self.fetcher.fetch(&package, &update.version).await?;
            let Some(generators) = &document.generators else {
                return Ok(Vec::new());
            };

            let mut entries = Vec::new();
            for (name, migration) in generators {
                let Some(migration_version) = &migration.version else {
                    continue;
                };
                if version::gt(migration_version, &installed_version)
                    && version::lte(migration_version, &update.version)
                    && self.are_migration_requirements_met(&package, &update.version, migration)
                {
                    entries.push(MigrationEntry {
                        package: package.clone(),
                        name: name.clone(),
                        version: migration_version.clone(),
                        description: migration.description.clone(),
                        cli: migration.cli.clone(),
                        implementation: migration.implementation.clone(),
                        factory: migration.factory.clone(),
                        requires: migration.requires.clone(),
                    });
                }
            }
            Ok::<Vec<MigrationEntry>, MigrateError>(entries)
        }))
        .await;

        let mut migrations = Vec::new();
        for result in results {
            migrations.extend(result?);
        }
        Ok(migrations)
    }

    fn are_migration_requirements_met(
        &self,
        package: &str,
        plan_version: &str,
        migration: &MigrationGenerator,
    ) -> bool {
        if !self.options.exclude_applied_migrations {
            return self.are_requirements_met(&migration.requires, None);
        }

        (self.was_migration_skipped(&migration.requires)
            || self.is_migration_for_higher_version(package, plan_version, migration))
            && self.are_requirements_met(&migration.requires, None)
    }

    /// A migration was skipped on a previous run if it has requirements and
    /// at least one of them was unmet by what is actually on disk.
    fn was_migration_skipped(&self, requires: &IndexMap<String, String>) -> bool {
        if requires.is_empty() {
            return false;
        }
        requires
            .iter()
            .any(|(name, range)| match self.installed.get_actual(name) {
                Some(installed) => !version::satisfies(&installed, range),
                None => true,
            })
    }

    /// Compares against what is actually on disk, deliberately ignoring
    /// `--from` overrides: a migration the workspace already sits above has
    /// been applied.
    fn is_migration_for_higher_version(
        &self,
        package: &str,
        plan_version: &str,
        migration: &MigrationGenerator,
    ) -> bool {
        let Some(migration_version) = &migration.version else {
            return false;
        };
        let above_installed = match self.installed.get_actual(package) {
            Some(installed) => version::gt(migration_version, &installed),
            None => true,
        };
        above_installed && version::lte(migration_version, plan_version)
    }
}

/// Before the package split, the workspace package anchored a fixed group
/// of same-cadence siblings.
fn legacy_workspace_group() -> Vec<PackageGroupEntry> {
    const MEMBERS: &[&str] = &[
        "@nrwl/angular",
        "@nrwl/cypress",
        "@nrwl/devkit",
        "@nrwl/eslint-plugin-nx",
        "@nrwl/express",
        "@nrwl/jest",
        "@nrwl/linter",
        "@nrwl/nest",
        "@nrwl/next",
        "@nrwl/node",
        "@nrwl/nx-plugin",
        "@nrwl/react",
        "@nrwl/storybook",
        "@nrwl/web",
        "nx",
    ];

    let mut group: Vec<PackageGroupEntry> = MEMBERS
        .iter()
        .map(|package| PackageGroupEntry {
            package: package.to_string(),
            version: "*".to_string(),
        })
        .collect();
    group.push(PackageGroupEntry {
        package: "@nrwl/nx-cloud".to_string(),
        version: "latest".to_string(),
    });
    group
}

/// Parse the positional `<package>[@<version>]` argument. A bare version or
/// tag picks the target package by the version-split threshold.
pub fn parse_target_spec(input: &str) -> Result<(String, String)> {
    let input = input.trim();

    // Split at the last `@`, ignoring a scope marker in position zero.
    if input.len() > 1
        && let Some(at) = input[1..].rfind('@').map(|index| index + 1)
    {
        let package = &input[..at];
        let raw_version = &input[at + 1..];
        return Ok((
            package.to_string(),
            version::normalize_version_with_tag_check(raw_version),
        ));
    }

    if version::is_version_tag(input) || looks_like_version(input) {
        let target_version = version::normalize_version_with_tag_check(input);
        let package = if !version::is_version_tag(input)
            && version::lt(&target_version, PACKAGE_SPLIT_VERSION)
        {
            "@nrwl/workspace"
        } else {
            "nx"
        };
        return Ok((package.to_string(), target_version));
    }

    Ok((input.to_string(), "latest".to_string()))
}

fn looks_like_version(value: &str) -> bool {
    if Version::parse(value).is_ok() {
        return true;
    }
    !value.is_empty()
        && value.split('.').count() <= 3
        && value
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

/// Parse `--from`/`--to` value lists of the form `p1@v1,p2@v2`.
pub fn parse_version_overrides(flag: &str, input: &str) -> Result<BTreeMap<String, String>> {
    let mut overrides = BTreeMap::new();

    for spec in input.split(',') {
        let spec = spec.trim();
        let at = if spec.len() > 1 {
            spec[1..].rfind('@').map(|index| index + 1)
        } else {
            None
        };
        let Some(at) = at else {
            return Err(MigrateError::MalformedVersionOverride {
                flag: flag.to_string(),
            });
        };

        let package = &spec[..at];
        let raw_version = &spec[at + 1..];
        if package.is_empty() || raw_version.is_empty() {
            return Err(MigrateError::MalformedVersionOverride {
                flag: flag.to_string(),
            });
        }

        overrides.insert(
            package.to_string(),
            version::normalize_version(raw_version),
        );
    }

    Ok(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::FakeRegistry;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPrompt {
        answer: bool,
        calls: Arc<AtomicUsize>,
    }
    impl UpdatePrompt for CountingPrompt {
        fn confirm(&self, _message: &str) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer)
        }
    }

    fn manifest_with(deps: &[(&str, &str)]) -> Manifest {
        let mut manifest = Manifest::default();
        for (name, range) in deps {
            manifest
                .dependencies
                .insert(name.to_string(), range.to_string());
        }
        manifest
    }

    fn installed_from(packages: &[(&str, &str)]) -> BTreeMap<String, String> {
        packages
            .iter()
            .map(|(name, version)| (name.to_string(), version.to_string()))
            .collect()
    }

    fn migrator(
        registry: Arc<FakeRegistry>,
        installed: &[(&str, &str)],
        options: MigratorOptions,
    ) -> Migrator {
        let manifest = manifest_with(installed);
        Migrator::new(
            Fetcher::new(registry),
            InstalledVersions::fixed(installed_from(installed), BTreeMap::new()),
            manifest,
            options,
        )
    }

    #[tokio::test]
    async fn single_package_plan_and_window() {
        let registry = Arc::new(FakeRegistry::new().with_migrations(
            "pkg",
            "2.0.0",
            json!({
                "packageJsonUpdates": {
                    "a": { "version": "2.0.0", "packages": { "pkg": { "version": "2.0.0" } } }
                },
                "generators": {
                    "m1": { "version": "1.5.0" },
                    "m2": { "version": "2.0.0" },
                    "m3": { "version": "2.1.0" }
                }
            }),
        ));

        let migrator = migrator(registry, &[("pkg", "1.0.0")], MigratorOptions::default());
        let plan = migrator.migrate("pkg", "2.0.0").await.unwrap();

        assert_eq!(plan.package_updates.len(), 1);
        let update = plan.package_updates.get("pkg").unwrap();
        assert_eq!(update.version, "2.0.0");
        assert_eq!(update.add_to_package_json, None);

        let names: Vec<&str> = plan.migrations.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn package_group_wildcard_resolves_to_parent_target() {
        let registry = Arc::new(
            FakeRegistry::new()
                .with_migrations(
                    "root",
                    "2.0.0",
                    json!({ "packageGroup": [{ "package": "child", "version": "*" }] }),
                )
                .with_bare("child", "2.0.0"),
        );

        let migrator = migrator(
            registry,
            &[("root", "1.0.0"), ("child", "1.0.0")],
            MigratorOptions::default(),
        );
        let plan = migrator.migrate("root", "2.0.0").await.unwrap();

        assert_eq!(plan.package_updates.get("root").unwrap().version, "2.0.0");
        assert_eq!(plan.package_updates.get("child").unwrap().version, "2.0.0");
    }

    #[tokio::test]
    async fn requires_gates_out_an_update() {
        let registry = Arc::new(FakeRegistry::new().with_migrations(
            "pkg",
            "2.0.0",
            json!({
                "packageJsonUpdates": {
                    "needs-peer": {
                        "version": "2.0.0",
                        "requires": { "peer": ">=3.0.0" },
                        "packages": { "extra": { "version": "9.9.9", "addToPackageJson": "dependencies" } }
                    }
                }
            }),
        ));

        let migrator = migrator(
            registry,
            &[("pkg", "1.0.0"), ("peer", "2.0.0")],
            MigratorOptions::default(),
        );
        let plan = migrator.migrate("pkg", "2.0.0").await.unwrap();

        assert!(plan.package_updates.get("extra").is_none());
        assert_eq!(plan.package_updates.get("pkg").unwrap().version, "2.0.0");
    }

    #[tokio::test]
    async fn requires_satisfied_by_plan_admits_update() {
        let registry = Arc::new(
            FakeRegistry::new()
                .with_migrations(
                    "pkg",
                    "2.0.0",
                    json!({
                        "packageJsonUpdates": {
                            "bump-peer": {
                                "version": "2.0.0",
                                "packages": { "peer": { "version": "3.0.0" } }
                            },
                            "needs-peer": {
                                "version": "2.0.0",
                                "requires": { "peer": ">=3.0.0" },
                                "packages": { "extra": { "version": "1.0.0", "alwaysAddToPackageJson": true } }
                            }
                        }
                    }),
                )
                .with_bare("peer", "3.0.0"),
        );

        let migrator = migrator(
            registry,
            &[("pkg", "1.0.0"), ("peer", "2.0.0")],
            MigratorOptions::default(),
        );
        let plan = migrator.migrate("pkg", "2.0.0").await.unwrap();

        // peer is admitted by the first update, which satisfies the second
        // update's predicate within the same pass.
        assert_eq!(plan.package_updates.get("peer").unwrap().version, "3.0.0");
        let extra = plan.package_updates.get("extra").unwrap();
        assert_eq!(extra.version, "1.0.0");
        assert_eq!(
            extra.add_to_package_json,
            Some(PackageJsonSection::Dependencies)
        );
    }

    #[tokio::test]
    async fn uninstalled_package_is_planned_without_recursion() {
        let registry = Arc::new(FakeRegistry::new());
        let migrator = Migrator::new(
            Fetcher::new(registry.clone()),
            InstalledVersions::fixed(BTreeMap::new(), BTreeMap::new()),
            Manifest::default(),
            MigratorOptions::default(),
        );

        let plan = migrator.migrate("pkg", "2.0.0").await.unwrap();
        assert_eq!(plan.package_updates.get("pkg").unwrap().version, "2.0.0");
        assert!(plan.migrations.is_empty());
        assert_eq!(registry.resolve_calls(), 0);
    }

    #[test]
    fn version_threshold_picks_target_package() {
        let (package, version) = parse_target_spec("15").unwrap();
        assert_eq!(package, "nx");
        assert_eq!(version, "15.0.0");

        let (package, version) = parse_target_spec("13").unwrap();
        assert_eq!(package, "@nrwl/workspace");
        assert_eq!(version, "13.0.0");

        let (package, version) = parse_target_spec("latest").unwrap();
        assert_eq!(package, "nx");
        assert_eq!(version, "latest");

        let (package, version) = parse_target_spec("some-plugin@2.1").unwrap();
        assert_eq!(package, "some-plugin");
        assert_eq!(version, "2.1.0");

        let (package, version) = parse_target_spec("@scope/plugin@next").unwrap();
        assert_eq!(package, "@scope/plugin");
        assert_eq!(version, "next");

        let (package, version) = parse_target_spec("@scope/plugin").unwrap();
        assert_eq!(package, "@scope/plugin");
        assert_eq!(version, "latest");
    }

    #[test]
    fn version_override_parsing() {
        let overrides = parse_version_overrides("from", "pkg@1.2,@scope/other@3.0.0").unwrap();
        assert_eq!(overrides.get("pkg").map(String::as_str), Some("1.2.0"));
        assert_eq!(
            overrides.get("@scope/other").map(String::as_str),
            Some("3.0.0")
        );

        let err = parse_version_overrides("from", "no-version").unwrap_err();
        assert!(err.to_string().contains("--from"));
        assert!(parse_version_overrides("to", "pkg@").is_err());
        assert!(parse_version_overrides("to", "@1.0.0").is_err());
    }

    #[tokio::test]
    async fn unresolvable_target_suggests_to_flag() {
        let registry = Arc::new(FakeRegistry::new());
        let migrator = migrator(registry, &[("pkg", "1.0.0")], MigratorOptions::default());

        let err = migrator.migrate("pkg", "99.0.0").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("No matching version"));
        assert!(message.contains("--to=\"package@version\""));
    }

    #[tokio::test]
    async fn fixed_point_discards_lower_revisits() {
        // root pulls pkg at 3.0.0 first; pkg's own group then points back at
        // root with a lower version, which the fixed point discards.
        let registry = Arc::new(
            FakeRegistry::new()
                .with_migrations(
                    "root",
                    "3.0.0",
                    json!({ "packageGroup": [{ "package": "pkg", "version": "*" }] }),
                )
                .with_migrations(
                    "pkg",
                    "3.0.0",
                    json!({ "packageGroup": [{ "package": "root", "version": "2.0.0" }] }),
                )
                .with_bare("root", "2.0.0"),
        );

        let migrator = migrator(
            registry.clone(),
            &[("root", "1.0.0"), ("pkg", "1.0.0")],
            MigratorOptions::default(),
        );
        let plan = migrator.migrate("root", "3.0.0").await.unwrap();

        assert_eq!(plan.package_updates.get("root").unwrap().version, "3.0.0");
        assert_eq!(plan.package_updates.get("pkg").unwrap().version, "3.0.0");
    }

    #[tokio::test]
    async fn to_override_rewrites_every_visit_and_respects_fixed_point() {
        // pkg is reached twice, from root and from a, both demanding 3.0.0.
        // The --to override rewrites both visits to 2.5.0; the second visit
        // finds 2.5.0 already collected and is discarded.
        let registry = Arc::new(
            FakeRegistry::new()
                .with_migrations(
                    "root",
                    "3.0.0",
                    json!({
                        "packageGroup": [
                            { "package": "a", "version": "*" },
                            { "package": "pkg", "version": "*" }
                        ]
                    }),
                )
                .with_migrations(
                    "a",
                    "3.0.0",
                    json!({ "packageGroup": [{ "package": "pkg", "version": "*" }] }),
                )
                .with_bare("pkg", "2.5.0"),
        );

        let mut options = MigratorOptions::default();
        options.to.insert("pkg".to_string(), "2.5.0".to_string());

        let migrator = migrator(
            registry,
            &[("root", "1.0.0"), ("a", "1.0.0"), ("pkg", "1.0.0")],
            options,
        );
        let plan = migrator.migrate("root", "3.0.0").await.unwrap();

        assert_eq!(plan.package_updates.get("root").unwrap().version, "3.0.0");
        assert_eq!(plan.package_updates.get("a").unwrap().version, "3.0.0");
        assert_eq!(plan.package_updates.get("pkg").unwrap().version, "2.5.0");
    }

    #[tokio::test]
    async fn planning_is_deterministic() {
        let doc = json!({
            "packageGroup": [
                { "package": "b", "version": "*" },
                { "package": "a", "version": "*" }
            ],
            "generators": {
                "g2": { "version": "2.0.0" },
                "g1": { "version": "1.5.0" }
            }
        });

        let mut plans = Vec::new();
        for _ in 0..2 {
            let registry = Arc::new(
                FakeRegistry::new()
                    .with_migrations("root", "2.0.0", doc.clone())
                    .with_bare("a", "2.0.0")
                    .with_bare("b", "2.0.0"),
            );
            let migrator = migrator(
                registry,
                &[("root", "1.0.0"), ("a", "1.0.0"), ("b", "1.0.0")],
                MigratorOptions::default(),
            );
            plans.push(migrator.migrate("root", "2.0.0").await.unwrap());
        }

        let keys: Vec<Vec<&String>> = plans
            .iter()
            .map(|plan| plan.package_updates.keys().collect())
            .collect();
        assert_eq!(keys[0], keys[1]);
        assert_eq!(plans[0].migrations, plans[1].migrations);

        // Generator order within the package follows document order.
        let names: Vec<&str> = plans[0]
            .migrations
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(names, vec!["g2", "g1"]);

        // No duplicate (package, name) pairs.
        let mut seen = std::collections::BTreeSet::new();
        for migration in &plans[0].migrations {
            assert!(seen.insert((migration.package.clone(), migration.name.clone())));
        }
    }

    #[tokio::test]
    async fn interactive_prompt_gates_updates_per_update() {
        let doc = json!({
            "packageJsonUpdates": {
                "prompted": {
                    "version": "2.0.0",
                    "x-prompt": "Apply the optional style updates?",
                    "packages": { "styles": { "version": "2.0.0", "alwaysAddToPackageJson": true } }
                },
                "silent": {
                    "version": "2.0.0",
                    "requires": { "pkg": ">=1.0.0" },
                    "packages": { "base": { "version": "2.0.0", "alwaysAddToPackageJson": true } }
                }
            }
        });

        for (answer, expect_styles) in [(false, false), (true, true)] {
            let registry = Arc::new(
                FakeRegistry::new()
                    .with_migrations("pkg", "2.0.0", doc.clone())
                    .with_bare("styles", "2.0.0")
                    .with_bare("base", "2.0.0"),
            );
            let calls = Arc::new(AtomicUsize::new(0));
            let options = MigratorOptions {
                interactive: true,
                ..Default::default()
            };
            let migrator = migrator(registry, &[("pkg", "1.0.0")], options).with_prompt(Box::new(
                CountingPrompt {
                    answer,
                    calls: calls.clone(),
                },
            ));

            let plan = migrator.migrate("pkg", "2.0.0").await.unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(plan.package_updates.contains_key("styles"), expect_styles);
            // The update without a prompt is applied either way.
            assert!(plan.package_updates.contains_key("base"));
        }
    }

    #[tokio::test]
    async fn migration_requires_checked_against_final_state() {
        let registry = Arc::new(
            FakeRegistry::new()
                .with_migrations(
                    "pkg",
                    "2.0.0",
                    json!({
                        "packageJsonUpdates": {
                            "bump-peer": {
                                "version": "2.0.0",
                                "packages": { "peer": { "version": "3.0.0" } }
                            }
                        },
                        "generators": {
                            "needs-new-peer": {
                                "version": "1.5.0",
                                "requires": { "peer": ">=3.0.0" }
                            },
                            "needs-old-peer": {
                                "version": "1.5.0",
                                "requires": { "peer": "<3.0.0" }
                            }
                        }
                    }),
                )
                .with_bare("peer", "3.0.0"),
        );

        let migrator = migrator(
            registry,
            &[("pkg", "1.0.0"), ("peer", "2.0.0")],
            MigratorOptions::default(),
        );
        let plan = migrator.migrate("pkg", "2.0.0").await.unwrap();

        let names: Vec<&str> = plan.migrations.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["needs-new-peer"]);
    }

    #[tokio::test]
    async fn exclude_applied_keeps_previously_skipped_migrations() {
        // peer sat below the requirement when the workspace was migrated
        // before, so the migration was skipped then and must run now.
        let registry = Arc::new(
            FakeRegistry::new()
                .with_migrations(
                    "pkg",
                    "2.0.0",
                    json!({
                        "packageJsonUpdates": {
                            "bump-peer": {
                                "version": "2.0.0",
                                "packages": { "peer": { "version": "3.0.0" } }
                            }
                        },
                        "generators": {
                            "m": { "version": "1.5.0", "requires": { "peer": ">=3.0.0" } }
                        }
                    }),
                )
                .with_bare("peer", "3.0.0"),
        );

        let options = MigratorOptions {
            exclude_applied_migrations: true,
            ..Default::default()
        };
        let migrator = migrator(registry, &[("pkg", "1.0.0"), ("peer", "2.0.0")], options);
        let plan = migrator.migrate("pkg", "2.0.0").await.unwrap();

        let names: Vec<&str> = plan.migrations.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["m"]);
    }

    #[tokio::test]
    async fn exclude_applied_drops_migrations_below_actual_installed() {
        // The user replays history with --from, but the workspace already
        // sits at 2.0.0: requirement-free migrations below that are applied.
        let registry = Arc::new(FakeRegistry::new().with_migrations(
            "pkg",
            "2.0.0",
            json!({
                "generators": {
                    "old": { "version": "1.5.0" },
                    "new": { "version": "2.0.0" }
                }
            }),
        ));

        let mut from = BTreeMap::new();
        from.insert("pkg".to_string(), "1.0.0".to_string());
        let installed = InstalledVersions::fixed(installed_from(&[("pkg", "2.0.0")]), from);

        let options = MigratorOptions {
            exclude_applied_migrations: true,
            ..Default::default()
        };
        let migrator = Migrator::new(
            Fetcher::new(registry),
            installed,
            manifest_with(&[("pkg", "2.0.0")]),
            options,
        );

        let plan = migrator.migrate("pkg", "2.0.0").await.unwrap();
        let names: Vec<&str> = plan.migrations.iter().map(|m| m.name.as_str()).collect();
        // Without the flag both would be in the window (override 1.0.0).
        assert_eq!(names, Vec::<&str>::new());

        let registry = Arc::new(FakeRegistry::new().with_migrations(
            "pkg",
            "2.0.0",
            json!({
                "generators": {
                    "old": { "version": "1.5.0" },
                    "new": { "version": "2.0.0" }
                }
            }),
        ));
        let mut from = BTreeMap::new();
        from.insert("pkg".to_string(), "1.0.0".to_string());
        let migrator = Migrator::new(
            Fetcher::new(registry),
            InstalledVersions::fixed(installed_from(&[("pkg", "2.0.0")]), from),
            manifest_with(&[("pkg", "2.0.0")]),
            MigratorOptions::default(),
        );
        let plan = migrator.migrate("pkg", "2.0.0").await.unwrap();
        let names: Vec<&str> = plan.migrations.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["old", "new"]);
    }

    #[tokio::test]
    async fn group_order_drives_visit_order() {
        // Both children carry deferred updates (non-empty requires); the
        // flattened result is sorted by group declaration order.
        let registry = Arc::new(
            FakeRegistry::new()
                .with_migrations(
                    "root",
                    "2.0.0",
                    json!({
                        "packageGroup": [
                            { "package": "second", "version": "*" },
                            { "package": "first", "version": "*" }
                        ]
                    }),
                )
                .with_migrations(
                    "second",
                    "2.0.0",
                    json!({
                        "packageJsonUpdates": {
                            "u": {
                                "version": "2.0.0",
                                "requires": { "second": ">=1.0.0" },
                                "packages": { "dep-b": { "version": "2.0.0", "alwaysAddToPackageJson": true } }
                            }
                        }
                    }),
                )
                .with_migrations(
                    "first",
                    "2.0.0",
                    json!({
                        "packageJsonUpdates": {
                            "u": {
                                "version": "2.0.0",
                                "requires": { "first": ">=1.0.0" },
                                "packages": { "dep-a": { "version": "2.0.0", "alwaysAddToPackageJson": true } }
                            }
                        }
                    }),
                )
                .with_bare("dep-a", "2.0.0")
                .with_bare("dep-b", "2.0.0"),
        );

        let migrator = migrator(
            registry,
            &[("root", "1.0.0"), ("second", "1.0.0"), ("first", "1.0.0")],
            MigratorOptions::default(),
        );
        let plan = migrator.migrate("root", "2.0.0").await.unwrap();

        let keys: Vec<&String> = plan.package_updates.keys().collect();
        let b_pos = keys.iter().position(|k| *k == "dep-b").unwrap();
        let a_pos = keys.iter().position(|k| *k == "dep-a").unwrap();
        assert!(b_pos < a_pos, "group order should place second before first");
    }
}
