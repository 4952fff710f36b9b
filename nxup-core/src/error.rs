use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Failed to read file {path:?}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[error("Failed to write file {path:?}: {source}")]
    WriteFile { path: PathBuf, source: std::io::Error },

    #[error("Failed to parse JSON in {path:?}: {source}")]
    ParseJson { path: PathBuf, source: serde_json::Error },

    #[error("Failed to serialize JSON for {path:?}: {reason}")]
    SerializeJson { path: PathBuf, reason: String },

    #[error("Project manifest package.json not found at {path:?}")]
    ManifestMissing { path: PathBuf },

    #[error("Workspace configuration {path:?} is invalid: {reason}")]
    WorkspaceConfig { path: PathBuf, reason: String },

    #[error("HTTP request to {url} failed: {source}")]
    Http { url: String, source: reqwest::Error },

    #[error("No matching version found for {name}@{range}: {reason}")]
    ResolutionFailed {
        name: String,
        range: String,
        reason: String,
    },

    #[error("Failed to parse version for {value}: {reason}")]
    Semver { value: String, reason: String },

    #[error("Failed to unpack archive into {path:?}: {source}")]
    Archive { path: PathBuf, source: std::io::Error },

    #[error("Failed to extract migrations of {package}@{version}: {reason}")]
    MigrationsUnavailable {
        package: String,
        version: String,
        reason: String,
    },

    #[error("Failed to fetch {package}@{version}: {message}")]
    FetchFailed {
        package: String,
        version: String,
        message: String,
    },

    #[error("{message}\nRun migrate with --to=\"package@version\"")]
    InvalidTargetVersion { message: String },

    #[error("Incorrect '--{flag}' section. Use --{flag}=\"package@version\"")]
    MalformedVersionOverride { flag: String },

    #[error("Migrations file not found at {path:?}")]
    MigrationsFileMissing { path: PathBuf },

    #[error("Could not find implementation of {name} from {package}")]
    ImplementationMissing { package: String, name: String },

    #[error("Failed to run migration {name} from {package}: {reason}")]
    MigrationFailed {
        package: String,
        name: String,
        reason: String,
    },

    #[error("Installation command '{command}' failed: {reason}")]
    InstallFailed { command: String, reason: String },

    #[error("I/O error at {path:?}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
}
