//! Diffing the schema registry against the live database.
//!
//! Only additive changes are generated: missing tables and missing columns.
//! Tables present in the database but absent from the registry are reported
//! and left alone, since they usually mean an entity was never registered
//! rather than one that should be dropped.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::config::Backend;
use crate::db::schema::{ColumnDef, SchemaRegistry, TableDef};
use crate::error::MigrationError;
use crate::migrate::engine::SyncEngine;
use crate::migrate::VERSION_TABLE;

/// Table and column names as they exist in the database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSchema {
    tables: BTreeMap<String, BTreeSet<String>>,
}

impl LiveSchema {
    pub fn from_pairs<I, T, C>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (T, C)>,
        T: Into<String>,
        C: Into<String>,
    {
        let mut tables: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (table, column) in pairs {
            tables.entry(table.into()).or_default().insert(column.into());
        }
        Self { tables }
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.tables
            .get(table)
            .map_or(false, |columns| columns.contains(column))
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

/// Reads the current schema through the migration engine.
pub fn inspect(engine: &mut SyncEngine) -> Result<LiveSchema, MigrationError> {
    let sql = match engine.backend() {
        Backend::Postgres => {
            "SELECT table_name::text, column_name::text \
             FROM information_schema.columns \
             WHERE table_schema = current_schema() \
             ORDER BY table_name, ordinal_position"
        }
        Backend::Sqlite => {
            "SELECT m.name, p.name \
             FROM sqlite_master AS m \
             JOIN pragma_table_info(m.name) AS p \
             WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%' \
             ORDER BY m.name, p.cid"
        }
    };

    let rows = engine.fetch_text_rows(sql)?;
    let live = LiveSchema::from_pairs(
        rows.into_iter()
            .filter_map(|mut row| {
                let column = row.pop()?;
                let table = row.pop()?;
                Some((table, column))
            })
            .filter(|(table, _)| table != VERSION_TABLE),
    );
    debug!(tables = live.tables.len(), "inspected live schema");
    Ok(live)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingColumn {
    pub table: TableDef,
    pub column: ColumnDef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    pub missing_tables: Vec<TableDef>,
    pub missing_columns: Vec<MissingColumn>,
    pub unknown_tables: Vec<String>,
}

impl SchemaDiff {
    /// True when there is nothing to generate. Unknown tables are drift
    /// worth reporting but produce no DDL.
    pub fn is_empty(&self) -> bool {
        self.missing_tables.is_empty() && self.missing_columns.is_empty()
    }

    pub fn has_drift(&self) -> bool {
        !self.is_empty() || !self.unknown_tables.is_empty()
    }

    pub fn upgrade_sql(&self, backend: Backend) -> Vec<String> {
        let mut statements: Vec<String> = self
            .missing_tables
            .iter()
            .flat_map(|t| t.create_sql(backend, false))
            .collect();
        statements.extend(
            self.missing_columns
                .iter()
                .map(|m| m.table.add_column_sql(&m.column, backend)),
        );
        statements
    }

    /// One human-readable line per difference.
    pub fn summary(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .missing_tables
            .iter()
            .map(|t| format!("add table {}", t.name))
            .collect();
        lines.extend(
            self.missing_columns
                .iter()
                .map(|m| format!("add column {}.{}", m.table.name, m.column.name)),
        );
        lines.extend(
            self.unknown_tables
                .iter()
                .map(|t| format!("table {} exists in the database but is not registered", t)),
        );
        lines
    }
}

pub fn compare(registry: &SchemaRegistry, live: &LiveSchema) -> SchemaDiff {
    let mut diff = SchemaDiff::default();

    for table in registry.sorted_tables() {
        if !live.has_table(table.name) {
            diff.missing_tables.push(table.clone());
            continue;
        }
        for column in &table.columns {
            if !live.has_column(table.name, column.name) {
                diff.missing_columns.push(MissingColumn {
                    table: table.clone(),
                    column: column.clone(),
                });
            }
        }
    }

    diff.unknown_tables = live
        .table_names()
        .filter(|name| !registry.contains(name))
        .map(str::to_string)
        .collect();

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::ColumnType;

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register_table(
                TableDef::new("source")
                    .column(ColumnDef::id("id", ColumnType::Integer))
                    .column(ColumnDef::new("name", ColumnType::Varchar(8))),
            )
            .unwrap()
            .register_table(
                TableDef::new("compound")
                    .column(ColumnDef::id("id", ColumnType::Integer))
                    .column(ColumnDef::new("source_id", ColumnType::Integer).references("source", "id")),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_empty_database_needs_every_table() {
        let diff = compare(&registry(), &LiveSchema::default());
        let names: Vec<_> = diff.missing_tables.iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["source", "compound"]);
        assert!(diff.missing_columns.is_empty());
        assert_eq!(diff.upgrade_sql(Backend::Sqlite).len(), 2);
    }

    #[test]
    fn test_detects_missing_columns_and_unknown_tables() {
        let live = LiveSchema::from_pairs([
            ("source", "id"),
            ("compound", "id"),
            ("compound", "source_id"),
            ("legacy", "id"),
        ]);
        let diff = compare(&registry(), &live);

        assert!(diff.missing_tables.is_empty());
        assert_eq!(diff.missing_columns.len(), 1);
        assert_eq!(diff.missing_columns[0].column.name, "name");
        assert_eq!(diff.unknown_tables, vec!["legacy".to_string()]);
        assert_eq!(
            diff.upgrade_sql(Backend::Postgres),
            vec!["ALTER TABLE source ADD COLUMN name VARCHAR(8)".to_string()]
        );
        assert_eq!(
            diff.summary(),
            vec![
                "add column source.name".to_string(),
                "table legacy exists in the database but is not registered".to_string(),
            ]
        );
    }

    #[test]
    fn test_added_column_keeps_its_foreign_key() {
        let live = LiveSchema::from_pairs([("source", "id"), ("source", "name"), ("compound", "id")]);
        let diff = compare(&registry(), &live);

        assert_eq!(diff.missing_columns.len(), 1);
        for backend in [Backend::Postgres, Backend::Sqlite] {
            assert_eq!(
                diff.upgrade_sql(backend),
                vec!["ALTER TABLE compound ADD COLUMN source_id INTEGER REFERENCES source (id)".to_string()]
            );
        }
    }

    #[test]
    fn test_in_sync_schema_is_empty() {
        let live = LiveSchema::from_pairs([
            ("source", "id"),
            ("source", "name"),
            ("compound", "id"),
            ("compound", "source_id"),
        ]);
        let diff = compare(&registry(), &live);
        assert!(diff.is_empty());
        assert!(!diff.has_drift());
    }
}
