use anyhow::Result;
use clap::Parser;
use nxup_core::planner::{self, MigratorOptions};
use nxup_core::registry::HttpRegistry;
use nxup_core::runner::{NodeScriptHost, RunOptions};
use nxup_core::{Manifest, MigrateConfig, Migrator, console, fetch::Fetcher, plan};
use nxup_core::installed::InstalledVersions;
use std::sync::Arc;
use std::{env, process};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::Cli;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        console::error(&format!("{error}"));
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_tracing()?;

    let args = Cli::parse();
    let config = MigrateConfig::from_env();

    if args.verbose || config.verbose {
        console::set_verbose(true);
    }

    let cwd = env::current_dir()?;

    if let Some(file) = args.run_migrations {
        console::heading(
            &format!("migrate --run-migrations={file}"),
            env!("CARGO_PKG_VERSION"),
        );

        let options = RunOptions {
            file,
            if_exists: args.if_exists,
            create_commits: args.create_commits,
            commit_prefix: args.commit_prefix,
            skip_install: config.skip_install,
        };
        nxup_core::runner::run_migrations(&cwd, &options, &NodeScriptHost).await?;
        return Ok(());
    }

    let Some(spec) = args.package_and_version else {
        anyhow::bail!(
            "Specify the package and version to migrate to, e.g. `nxup nx@latest`, \
             or pass --run-migrations"
        );
    };

    console::heading(&format!("migrate {spec}"), env!("CARGO_PKG_VERSION"));

    let (target_package, target_version) = planner::parse_target_spec(&spec)?;
    let from = match args.from.as_deref() {
        Some(value) => planner::parse_version_overrides("from", value)?,
        None => Default::default(),
    };
    let to = match args.to.as_deref() {
        Some(value) => planner::parse_version_overrides("to", value)?,
        None => Default::default(),
    };

    let manifest = Manifest::read(&cwd.join("package.json"))?;
    let installed = InstalledVersions::new(cwd.clone(), from);
    let fetcher = Fetcher::new(Arc::new(HttpRegistry::new(config.clone())));

    let options = MigratorOptions {
        to,
        interactive: args.interactive,
        exclude_applied_migrations: args.exclude_applied_migrations,
    };
    let migrator = Migrator::new(fetcher, installed, manifest, options);

    console::step(&format!(
        "Resolving migrations for {target_package}@{target_version}"
    ));
    let migration_plan = migrator.migrate(&target_package, &target_version).await?;

    for (name, update) in &migration_plan.package_updates {
        console::package_update(
            name,
            migrator.installed_version(name).as_deref(),
            &update.version,
        );
    }

    match plan::write_plan(&cwd, &migration_plan, migrator.installed())? {
        Some(count) => {
            console::info(&format!(
                "Created {} with {} migrations to run",
                plan::MIGRATIONS_FILE,
                count
            ));
            console::info("Apply them with `nxup --run-migrations`");
        }
        None => console::info("No migrations to run, package versions updated"),
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
