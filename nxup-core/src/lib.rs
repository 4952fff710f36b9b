pub mod config;
pub mod console;
pub mod document;
pub mod error;
pub mod fetch;
pub mod installed;
pub mod manifest;
pub mod plan;
pub mod planner;
pub mod registry;
pub mod runner;
pub mod version;
pub mod workspace;

pub use config::MigrateConfig;
pub use document::{MigrationEntry, PackageUpdate};
pub use error::MigrateError;
pub use manifest::Manifest;
pub use plan::MigrationPlan;
pub use planner::Migrator;

pub type Result<T> = std::result::Result<T, MigrateError>;
