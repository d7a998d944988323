//! Schema migrations: a linear chain of SQL revision scripts applied through
//! a synchronous engine, with the latest applied revision kept in
//! [`VERSION_TABLE`].

pub mod autogen;
pub mod engine;
pub mod history;
pub mod runner;
pub mod script;

pub use autogen::SchemaDiff;
pub use engine::SyncEngine;
pub use history::History;
pub use runner::{MigrationRunner, UpgradeReport};
pub use script::RevisionScript;

/// Single-row table holding the most recently applied revision.
pub const VERSION_TABLE: &str = "schema_version";
