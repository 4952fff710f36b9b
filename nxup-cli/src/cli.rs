use clap::Parser;
use nxup_core::runner::DEFAULT_COMMIT_PREFIX;

#[derive(Parser, Debug)]
#[command(name = "nxup", about = "plan and run workspace migrations")]
pub struct Cli {
    /// What to migrate to: `pkg@version`, `pkg@latest`, a bare package,
    /// a bare version, or the tags `latest`/`next`.
    pub package_and_version: Option<String>,

    /// Override what the planner considers installed, e.g. --from="nx@15.0.0"
    #[arg(long)]
    pub from: Option<String>,

    /// Override the version to aim at for listed packages, e.g. --to="nx@16.1.0"
    #[arg(long)]
    pub to: Option<String>,

    /// Gate optional package updates on their prompts
    #[arg(long)]
    pub interactive: bool,

    /// Skip migrations whose preconditions were already met on a previous run
    #[arg(long = "excludeAppliedMigrations")]
    pub exclude_applied_migrations: bool,

    /// Run the migrations recorded in the given file instead of planning
    #[arg(
        long = "run-migrations",
        num_args = 0..=1,
        default_missing_value = "migrations.json",
        value_name = "file"
    )]
    pub run_migrations: Option<String>,

    /// Do nothing when the migrations file does not exist
    #[arg(long = "ifExists")]
    pub if_exists: bool,

    /// Commit after each successful migration
    #[arg(long = "createCommits")]
    pub create_commits: bool,

    /// Prefix for per-migration commit messages
    #[arg(long = "commitPrefix", default_value = DEFAULT_COMMIT_PREFIX)]
    pub commit_prefix: String,

    #[arg(long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plan_mode() {
        let cli = Cli::parse_from(["nxup", "nx@latest", "--from=nx@15.0.0", "--interactive"]);
        assert_eq!(cli.package_and_version.as_deref(), Some("nx@latest"));
        assert_eq!(cli.from.as_deref(), Some("nx@15.0.0"));
        assert!(cli.interactive);
        assert!(cli.run_migrations.is_none());
    }

    #[test]
    fn run_migrations_defaults_its_file() {
        let cli = Cli::parse_from(["nxup", "--run-migrations"]);
        assert_eq!(cli.run_migrations.as_deref(), Some("migrations.json"));

        let cli = Cli::parse_from(["nxup", "--run-migrations=custom.json", "--ifExists"]);
        assert_eq!(cli.run_migrations.as_deref(), Some("custom.json"));
        assert!(cli.if_exists);
    }

    #[test]
    fn commit_flags() {
        let cli = Cli::parse_from(["nxup", "--run-migrations", "--createCommits"]);
        assert!(cli.create_commits);
        assert_eq!(cli.commit_prefix, DEFAULT_COMMIT_PREFIX);

        let cli = Cli::parse_from([
            "nxup",
            "--run-migrations",
            "--createCommits",
            "--commitPrefix=build: ",
        ]);
        assert_eq!(cli.commit_prefix, "build: ");
    }
}
