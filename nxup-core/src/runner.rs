use crate::document::{MigrationEntry, MigrationsFile};
use crate::manifest::dependency_snapshot;
use crate::{MigrateError, Result, console};
use async_trait::async_trait;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const DEFAULT_COMMIT_PREFIX: &str = "chore: [nx migration] ";

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub file: String,
    pub if_exists: bool,
    pub create_commits: bool,
    pub commit_prefix: String,
    pub skip_install: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            file: crate::plan::MIGRATIONS_FILE.to_string(),
            if_exists: false,
            create_commits: false,
            commit_prefix: DEFAULT_COMMIT_PREFIX.to_string(),
            skip_install: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileChange {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptOutcome {
    pub made_changes: bool,
    pub file_changes: Vec<FileChange>,
    pub logs: Vec<String>,
}

pub struct MigrationContext<'a> {
    pub workspace_root: &'a Path,
    pub migrations_dir: &'a Path,
    pub entry: &'a MigrationEntry,
}

/// Executes a single migration script. The scripts themselves are opaque;
/// this is the seam between the runner loop and whatever runs them.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    async fn run(&self, context: &MigrationContext<'_>) -> Result<ScriptOutcome>;

    /// Called once, before the loop, when any migration needs the
    /// non-native adapter.
    fn prepare_adapter(&self, _workspace_root: &Path) -> Result<()> {
        Ok(())
    }
}

/// Execute the migrations list in order. Each migration commits its own
/// changes to disk before the next one starts; a failure surfaces a titled
/// error and stops the run with everything before it already applied.
pub async fn run_migrations(
    workspace_root: &Path,
    options: &RunOptions,
    host: &dyn ScriptHost,
) -> Result<()> {
    let migrations_path = workspace_root.join(&options.file);
    if !migrations_path.is_file() {
        if options.if_exists {
            console::info(&format!(
                "Migrations file '{}' doesn't exist",
                options.file
            ));
            return Ok(());
        }
        return Err(MigrateError::MigrationsFileMissing {
            path: migrations_path,
        });
    }

    if !options.skip_install {
        install_dependencies(workspace_root)?;
    }

    let data = fs::read_to_string(&migrations_path).map_err(|source| MigrateError::ReadFile {
        path: migrations_path.clone(),
        source,
    })?;
    let file: MigrationsFile =
        serde_json::from_str(&data).map_err(|source| MigrateError::ParseJson {
            path: migrations_path.clone(),
            source,
        })?;

    let manifest_path = workspace_root.join("package.json");
    let deps_before = dependency_snapshot(&manifest_path)?;

    if file
        .migrations
        .iter()
        .any(|m| !matches!(m.cli.as_deref(), None | Some("nx")))
    {
        host.prepare_adapter(workspace_root)?;
    }

    let migrations_dir = migrations_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| workspace_root.to_path_buf());

    for entry in &file.migrations {
        let context = MigrationContext {
            workspace_root,
            migrations_dir: &migrations_dir,
            entry,
        };

        let outcome = match host.run(&context).await {
            Ok(outcome) => outcome,
            Err(err) => {
                console::titled_error(
                    &format!("Failed to run {} from {}", entry.name, entry.package),
                    &err.to_string(),
                );
                return Err(err);
            }
        };

        if !outcome.made_changes {
            console::migration_no_changes(&entry.name);
            continue;
        }

        console::migration_started(&entry.name, entry.description.as_deref());
        for change in &outcome.file_changes {
            console::file_change(&change.kind, &change.path);
        }
        for line in &outcome.logs {
            console::info(line);
        }
        console::migration_succeeded(&entry.name);

        if options.create_commits {
            let message = format!("{}{}", options.commit_prefix, entry.name);
            match commit_changes(workspace_root, &message) {
                Ok(sha) => console::verbose(&format!("committed {} as {}", entry.name, sha)),
                Err(err) => console::error(&format!(
                    "Failed to commit changes of {}: {}",
                    entry.name, err
                )),
            }
        }
    }

    if !options.skip_install && dependency_snapshot(&manifest_path)? != deps_before {
        console::step("Dependencies changed, reinstalling");
        install_dependencies(workspace_root)?;
    }

    Ok(())
}

fn commit_changes(workspace_root: &Path, message: &str) -> Result<String> {
    run_git(workspace_root, &["add", "-A"])?;
    run_git(workspace_root, &["commit", "--no-verify", "-m", message])?;
    let sha = run_git(workspace_root, &["rev-parse", "HEAD"])?;
    Ok(sha.trim().to_string())
}

fn run_git(workspace_root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workspace_root)
        .output()
        .map_err(|source| MigrateError::Io {
            path: workspace_root.to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        return Err(MigrateError::InstallFailed {
            command: format!("git {}", args.join(" ")),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Pick the install command from whichever lockfile the workspace carries.
pub fn detect_package_manager(workspace_root: &Path) -> &'static str {
    if workspace_root.join("pnpm-lock.yaml").is_file() {
        "pnpm"
    } else if workspace_root.join("yarn.lock").is_file() {
        "yarn"
    } else {
        "npm"
    }
}

fn install_dependencies(workspace_root: &Path) -> Result<()> {
    let manager = detect_package_manager(workspace_root);
    console::step(&format!("Installing dependencies with {}", manager));

    let output = Command::new(manager)
        .arg("install")
        .current_dir(workspace_root)
        .output()
        .map_err(|source| MigrateError::Io {
            path: workspace_root.to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        return Err(MigrateError::InstallFailed {
            command: format!("{} install", manager),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}

/// Runs migration scripts in a `node` subprocess. The native path drives the
/// workspace's own virtual-tree implementation and flushes its changes; the
/// legacy path delegates to the bundled CLI adapter. Either way the harness
/// reports `{madeChanges, changes, logs}` as JSON on stdout.
pub struct NodeScriptHost;

const NODE_HARNESS: &str = r#"
const [, , mode, target, migrationName, workspaceRoot] = process.argv;
(async () => {
  if (mode === 'native') {
    const treeModule = require.resolve('nx/src/generators/tree', { paths: [workspaceRoot] });
    const { FsTree, flushChanges } = require(treeModule);
    const tree = new FsTree(workspaceRoot, false);
    const moduleExports = require(target);
    const implementation = moduleExports.default ?? moduleExports;
    await implementation(tree, {});
    const changes = tree.listChanges();
    flushChanges(workspaceRoot, changes);
    process.stdout.write(JSON.stringify({
      madeChanges: changes.length > 0,
      changes: changes.map((c) => ({ type: c.type, path: c.path })),
      logs: [],
    }));
  } else {
    const adapterModule = require.resolve('nx/src/adapter/ngcli-adapter', { paths: [workspaceRoot] });
    const { runMigration } = require(adapterModule);
    const result = await runMigration(workspaceRoot, target, migrationName, []);
    process.stdout.write(JSON.stringify({
      madeChanges: !!result.madeChanges,
      changes: [],
      logs: result.loggingQueue ?? [],
    }));
  }
})().catch((err) => {
  process.stderr.write(String((err && err.stack) || err));
  process.exit(1);
});
"#;

#[derive(Debug, Default, Deserialize)]
struct HarnessResult {
    #[serde(default, rename = "madeChanges")]
    made_changes: bool,
    #[serde(default)]
    changes: Vec<FileChange>,
    #[serde(default)]
    logs: Vec<String>,
}

#[async_trait]
impl ScriptHost for NodeScriptHost {
    async fn run(&self, context: &MigrationContext<'_>) -> Result<ScriptOutcome> {
        let entry = context.entry;
        let native = matches!(entry.cli.as_deref(), None | Some("nx"));

        let (mode, target) = if native {
            let module = resolve_implementation(context)?;
            ("native", module.to_string_lossy().into_owned())
        } else {
            ("adapter", entry.package.clone())
        };

        let harness = tempfile::Builder::new()
            .prefix("nxup-harness")
            .suffix(".js")
            .tempfile()
            .and_then(|file| {
                fs::write(file.path(), NODE_HARNESS)?;
                Ok(file)
            })
            .map_err(|source| MigrateError::Io {
                path: std::env::temp_dir(),
                source,
            })?;

        let output = Command::new("node")
            .arg(harness.path())
            .arg(mode)
            .arg(&target)
            .arg(&entry.name)
            .arg(context.workspace_root)
            .current_dir(context.workspace_root)
            .output()
            .map_err(|source| MigrateError::Io {
                path: context.workspace_root.to_path_buf(),
                source,
            })?;

        if !output.status.success() {
            return Err(MigrateError::MigrationFailed {
                package: entry.package.clone(),
                name: entry.name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let result: HarnessResult =
            serde_json::from_str(stdout.trim()).map_err(|err| MigrateError::MigrationFailed {
                package: entry.package.clone(),
                name: entry.name.clone(),
                reason: format!("unparseable migration output: {err}"),
            })?;

        Ok(ScriptOutcome {
            made_changes: result.made_changes,
            file_changes: result.changes,
            logs: result.logs,
        })
    }

    fn prepare_adapter(&self, workspace_root: &Path) -> Result<()> {
        let output = Command::new("node")
            .arg("-e")
            .arg("require.resolve('nx/src/adapter/ngcli-adapter', { paths: [process.argv[1]] })")
            .arg(workspace_root)
            .output()
            .map_err(|source| MigrateError::Io {
                path: workspace_root.to_path_buf(),
                source,
            })?;

        if !output.status.success() {
            return Err(MigrateError::InstallFailed {
                command: "node -e require.resolve(...)".to_string(),
                reason: "the legacy CLI adapter is not installed in this workspace".to_string(),
            });
        }

        Ok(())
    }
}

/// Locate the implementation module the way the scripts themselves are
/// resolved: relative to the migrations-file directory first, then inside
/// the migration's package under `node_modules`, trying the path itself,
/// with a `.js` suffix, and as a directory index.
fn resolve_implementation(context: &MigrationContext<'_>) -> Result<PathBuf> {
    let entry = context.entry;
    let Some(implementation) = entry.implementation.as_deref().or(entry.factory.as_deref())
    else {
        return Err(MigrateError::ImplementationMissing {
            package: entry.package.clone(),
            name: entry.name.clone(),
        });
    };

    let relative = implementation.trim_start_matches("./");

    let mut bases = vec![context.migrations_dir.join(relative)];
    let mut current = Some(context.workspace_root);
    while let Some(dir) = current {
        let package_dir = dir.join("node_modules").join(&entry.package);
        if package_dir.is_dir() {
            bases.push(package_dir.join(relative));
        }
        current = dir.parent();
    }

    for base in bases {
        for candidate in [
            base.clone(),
            base.with_extension("js"),
            base.join("index.js"),
        ] {
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(MigrateError::ImplementationMissing {
        package: entry.package.clone(),
        name: entry.name.clone(),
    })
}
