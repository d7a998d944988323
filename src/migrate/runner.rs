use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::config::Settings;
use crate::db::schema::SchemaRegistry;
use crate::error::MigrationError;
use crate::migrate::autogen::{self, SchemaDiff};
use crate::migrate::engine::SyncEngine;
use crate::migrate::history::History;
use crate::migrate::script::{self, RevisionScript};
use crate::migrate::VERSION_TABLE;

/// Outcome of one `upgrade` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeReport {
    pub from: Option<String>,
    pub to: Option<String>,
    pub applied: Vec<String>,
}

impl UpgradeReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Applies the revision chain in `dir` through a synchronous engine.
///
/// Only one runner may work on a database at a time. The marker is
/// re-read inside every revision's transaction, so a second runner that
/// slipped in fails loudly instead of applying a revision twice.
pub struct MigrationRunner {
    engine: SyncEngine,
    dir: PathBuf,
    registry: SchemaRegistry,
}

impl MigrationRunner {
    pub fn new(engine: SyncEngine, dir: impl Into<PathBuf>, registry: SchemaRegistry) -> Self {
        Self {
            engine,
            dir: dir.into(),
            registry,
        }
    }

    pub fn from_settings(settings: &Settings, registry: SchemaRegistry) -> Result<Self, MigrationError> {
        let engine = SyncEngine::connect(settings)?;
        Ok(Self::new(engine, &settings.migrations.dir, registry))
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn engine(&mut self) -> &mut SyncEngine {
        &mut self.engine
    }

    fn ensure_version_table(&mut self) -> Result<(), MigrationError> {
        self.engine.execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (version_num VARCHAR(32) NOT NULL PRIMARY KEY)",
            VERSION_TABLE
        ))?;
        Ok(())
    }

    /// The most recently applied revision, `None` for an unmigrated database.
    pub fn current(&mut self) -> Result<Option<String>, MigrationError> {
        self.ensure_version_table()?;
        let rows = self
            .engine
            .fetch_text_rows(&format!("SELECT version_num FROM {}", VERSION_TABLE))?;
        match rows.as_slice() {
            [] => Ok(None),
            [row] => Ok(row.first().cloned()),
            _ => Err(MigrationError::BrokenChain(format!(
                "{} holds {} rows; expected at most one",
                VERSION_TABLE,
                rows.len()
            ))),
        }
    }

    pub fn history(&self) -> Result<History, MigrationError> {
        History::from_scripts(script::load_dir(&self.dir)?)
    }

    /// Applies every pending revision up to `target` (head when `None`).
    ///
    /// Revisions at or before the stored marker are skipped, so running this
    /// twice is harmless. Each revision commits together with its marker
    /// update; the first failure stops the run with the marker still naming
    /// the last revision that succeeded.
    pub fn upgrade(&mut self, target: Option<&str>) -> Result<UpgradeReport, MigrationError> {
        let history = self.history()?;
        let current = self.current()?;

        let pending = history.pending(current.as_deref(), target)?;
        if pending.is_empty() {
            info!(
                current = current.as_deref().unwrap_or("<base>"),
                "Database already at requested revision"
            );
            return Ok(UpgradeReport {
                from: current.clone(),
                to: current,
                applied: Vec::new(),
            });
        }

        let mut marker = current.clone();
        let mut applied = Vec::with_capacity(pending.len());
        for script in pending {
            self.apply(script, marker.as_deref())?;
            marker = Some(script.revision.clone());
            applied.push(script.revision.clone());
        }

        Ok(UpgradeReport {
            from: current,
            to: marker,
            applied,
        })
    }

    fn apply(&mut self, script: &RevisionScript, expected: Option<&str>) -> Result<(), MigrationError> {
        info!(
            revision = %script.revision,
            parent = script.down_revision.as_deref().unwrap_or("<base>"),
            message = %script.message,
            "Applying revision"
        );

        let revision = script.revision.as_str();
        let result = self.engine.transaction(|tx| {
            let marker = tx.fetch_optional_text(&format!("SELECT version_num FROM {}", VERSION_TABLE))?;
            if marker.as_deref() != expected {
                return Err(MigrationError::BrokenChain(format!(
                    "marker moved to {} while applying {}; is another migration running?",
                    marker.as_deref().unwrap_or("<base>"),
                    revision
                )));
            }

            if script.has_statements() {
                tx.execute(&script.sql)
                    .map_err(|source| MigrationError::ExecutionFailed {
                        revision: revision.to_string(),
                        source,
                    })?;
            }

            tx.execute(&format!("DELETE FROM {}", VERSION_TABLE))?;
            tx.execute_with(
                &format!("INSERT INTO {} (version_num) VALUES ($1)", VERSION_TABLE),
                revision,
            )?;
            Ok(())
        });

        match &result {
            Ok(()) => info!(revision, "Revision applied"),
            Err(e) => error!(revision, error = %e, "Revision failed; marker left unchanged"),
        }
        result
    }

    /// Differences between the registry and the live schema.
    pub fn diff(&mut self) -> Result<SchemaDiff, MigrationError> {
        self.registry.validate()?;
        let live = autogen::inspect(&mut self.engine)?;
        Ok(autogen::compare(&self.registry, &live))
    }

    /// Writes a new revision chained onto the current head.
    ///
    /// With `autogenerate`, the body is the DDL that brings the live schema
    /// in line with the registry, and the database must already be at head.
    pub fn generate(&mut self, message: &str, autogenerate: bool) -> Result<RevisionScript, MigrationError> {
        let history = if self.dir.exists() {
            self.history()?
        } else {
            History::default()
        };
        let head = history.head().map(|s| s.revision.clone());

        let body = if autogenerate {
            let current = self.current()?;
            if current != head {
                return Err(MigrationError::NotUpToDate {
                    current: current.unwrap_or_else(|| "<base>".into()),
                    head: head.unwrap_or_else(|| "<base>".into()),
                });
            }

            let diff = self.diff()?;
            for line in diff.summary() {
                info!("Detected: {}", line);
            }
            if diff.is_empty() {
                return Err(MigrationError::NothingToGenerate);
            }
            render_statements(&diff.upgrade_sql(self.engine.backend()))
        } else {
            "-- Write the upgrade statements for this revision here.".to_string()
        };

        let script = RevisionScript::new(&self.dir, head.as_deref(), message, body);
        script.write()?;
        info!(
            revision = %script.revision,
            path = %script.path.display(),
            "Generated revision"
        );
        Ok(script)
    }

    /// Like `diff`, but also warns about every difference found.
    pub fn check(&mut self) -> Result<SchemaDiff, MigrationError> {
        let diff = self.diff()?;
        for line in diff.summary() {
            warn!("Schema drift: {}", line);
        }
        Ok(diff)
    }

    pub fn close(self) -> Result<(), MigrationError> {
        self.engine.close()
    }
}

fn render_statements(statements: &[String]) -> String {
    statements
        .iter()
        .map(|s| format!("{};", s))
        .collect::<Vec<_>>()
        .join("\n\n")
}
