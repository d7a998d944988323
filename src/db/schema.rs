//! Schema metadata registry.
//!
//! Every persisted entity describes its table through [`Entity`], and the
//! registry collects those descriptions. The runtime path uses it to create
//! missing tables; the migration path diffs it against the live database.
//! A table that is never registered is invisible to both.

use crate::config::Backend;
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    BigInt,
    Boolean,
    Text,
    Varchar(u32),
    TimestampTz,
}

impl ColumnType {
    pub fn sql(&self, backend: Backend) -> String {
        match (self, backend) {
            (ColumnType::Integer, _) => "INTEGER".into(),
            (ColumnType::BigInt, _) => "BIGINT".into(),
            (ColumnType::Boolean, _) => "BOOLEAN".into(),
            (ColumnType::Text, _) => "TEXT".into(),
            (ColumnType::Varchar(len), _) => format!("VARCHAR({})", len),
            (ColumnType::TimestampTz, Backend::Postgres) => "TIMESTAMP WITH TIME ZONE".into(),
            (ColumnType::TimestampTz, Backend::Sqlite) => "TIMESTAMP".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: &'static str,
    pub column: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub default: Option<&'static str>,
    pub references: Option<ForeignKey>,
}

impl ColumnDef {
    pub fn new(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: true,
            primary_key: false,
            auto_increment: false,
            default: None,
            references: None,
        }
    }

    /// Auto-incrementing surrogate key.
    pub fn id(name: &'static str, ty: ColumnType) -> Self {
        Self {
            nullable: false,
            primary_key: true,
            auto_increment: true,
            ..Self::new(name, ty)
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Raw SQL default expression, e.g. `"false"` or `"'reviewer'"`.
    pub fn default_sql(mut self, expr: &'static str) -> Self {
        self.default = Some(expr);
        self
    }

    pub fn references(mut self, table: &'static str, column: &'static str) -> Self {
        self.references = Some(ForeignKey { table, column });
        self
    }

    fn definition(&self, backend: Backend) -> String {
        if self.primary_key && self.auto_increment {
            return match backend {
                Backend::Postgres => format!(
                    "{} {} GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY",
                    self.name,
                    self.ty.sql(backend)
                ),
                Backend::Sqlite => format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", self.name),
            };
        }

        let mut sql = format!("{} {}", self.name, self.ty.sql(backend));
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueConstraint {
    pub name: &'static str,
    pub columns: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: &'static str,
    pub columns: Vec<&'static str>,
    pub unique: bool,
}

/// Shape of one persisted table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: Vec<ColumnDef>,
    pub unique_constraints: Vec<UniqueConstraint>,
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            columns: Vec::new(),
            unique_constraints: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn unique_together(mut self, name: &'static str, columns: &[&'static str]) -> Self {
        self.unique_constraints.push(UniqueConstraint {
            name,
            columns: columns.to_vec(),
        });
        self
    }

    pub fn index(mut self, name: &'static str, columns: &[&'static str], unique: bool) -> Self {
        self.indexes.push(IndexDef {
            name,
            columns: columns.to_vec(),
            unique,
        });
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// `CREATE TABLE` followed by its index statements.
    pub fn create_sql(&self, backend: Backend, if_not_exists: bool) -> Vec<String> {
        let guard = if if_not_exists { "IF NOT EXISTS " } else { "" };

        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("    {}", c.definition(backend)))
            .collect();
        for constraint in &self.unique_constraints {
            parts.push(format!(
                "    CONSTRAINT {} UNIQUE ({})",
                constraint.name,
                constraint.columns.join(", ")
            ));
        }
        for column in &self.columns {
            if let Some(fk) = &column.references {
                parts.push(format!(
                    "    FOREIGN KEY ({}) REFERENCES {} ({})",
                    column.name, fk.table, fk.column
                ));
            }
        }

        let mut statements = vec![format!(
            "CREATE TABLE {}{} (\n{}\n)",
            guard,
            self.name,
            parts.join(",\n")
        )];
        statements.extend(self.indexes.iter().map(|index| {
            format!(
                "CREATE {}INDEX {}{} ON {} ({})",
                if index.unique { "UNIQUE " } else { "" },
                guard,
                index.name,
                self.name,
                index.columns.join(", ")
            )
        }));
        statements
    }

    /// `ALTER TABLE .. ADD COLUMN`, with the column's foreign key inline.
    pub fn add_column_sql(&self, column: &ColumnDef, backend: Backend) -> String {
        let mut sql = format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.name,
            column.definition(backend)
        );
        if let Some(fk) = &column.references {
            sql.push_str(&format!(" REFERENCES {} ({})", fk.table, fk.column));
        }
        sql
    }
}

/// A persisted type that knows its table shape.
pub trait Entity {
    const TABLE: &'static str;

    fn table_def() -> TableDef;
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchemaError {
    #[error("table '{0}' is registered twice with different shapes")]
    ConflictingTable(String),

    #[error("table '{table}' declares column '{column}' more than once")]
    DuplicateColumn { table: String, column: String },

    #[error("table '{table}' references unregistered table '{target}'")]
    UnregisteredReference { table: String, target: String },

    #[error("table '{table}' references missing column '{target}.{column}'")]
    MissingReferencedColumn {
        table: String,
        target: String,
        column: String,
    },

    #[error("table '{table}' constrains unknown column '{column}'")]
    UnknownConstraintColumn { table: String, column: String },
}

#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    tables: Vec<TableDef>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: Entity>(&mut self) -> Result<&mut Self, SchemaError> {
        self.register_table(E::table_def())
    }

    pub fn register_table(&mut self, table: TableDef) -> Result<&mut Self, SchemaError> {
        if let Some(existing) = self.table(table.name) {
            if *existing != table {
                return Err(SchemaError::ConflictingTable(table.name.to_string()));
            }
            debug!(table = table.name, "table already registered");
            return Ok(self);
        }
        debug!(table = table.name, columns = table.columns.len(), "registered table");
        self.tables.push(table);
        Ok(self)
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }

    pub fn table_names(&self) -> Vec<&'static str> {
        self.tables.iter().map(|t| t.name).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Checks that the registry is self-consistent: unique column names,
    /// constraints over real columns, and every foreign key pointing at a
    /// registered table. A dangling reference usually means an entity was
    /// never registered.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for table in &self.tables {
            let mut seen = HashSet::new();
            for column in &table.columns {
                if !seen.insert(column.name) {
                    return Err(SchemaError::DuplicateColumn {
                        table: table.name.into(),
                        column: column.name.into(),
                    });
                }
            }

            let constrained = table
                .unique_constraints
                .iter()
                .flat_map(|c| c.columns.iter())
                .chain(table.indexes.iter().flat_map(|i| i.columns.iter()));
            for column in constrained {
                if table.get_column(column).is_none() {
                    return Err(SchemaError::UnknownConstraintColumn {
                        table: table.name.into(),
                        column: (*column).into(),
                    });
                }
            }

            for fk in table.columns.iter().filter_map(|c| c.references.as_ref()) {
                let target = self.table(fk.table).ok_or_else(|| {
                    SchemaError::UnregisteredReference {
                        table: table.name.into(),
                        target: fk.table.into(),
                    }
                })?;
                if target.get_column(fk.column).is_none() {
                    return Err(SchemaError::MissingReferencedColumn {
                        table: table.name.into(),
                        target: fk.table.into(),
                        column: fk.column.into(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Tables ordered so that referenced tables come before the tables that
    /// point at them. Registration order breaks ties.
    pub fn sorted_tables(&self) -> Vec<&TableDef> {
        let mut placed: HashSet<&str> = HashSet::new();
        let mut ordered = Vec::with_capacity(self.tables.len());
        let mut pending: Vec<&TableDef> = self.tables.iter().collect();

        while !pending.is_empty() {
            let before = pending.len();
            pending.retain(|table| {
                let ready = table
                    .columns
                    .iter()
                    .filter_map(|c| c.references.as_ref())
                    .all(|fk| fk.table == table.name || placed.contains(fk.table) || !self.contains(fk.table));
                if ready {
                    placed.insert(table.name);
                    ordered.push(*table);
                }
                !ready
            });
            if pending.len() == before {
                // Reference cycle: keep registration order for the rest.
                ordered.append(&mut pending);
            }
        }
        ordered
    }

    /// DDL creating every registered table.
    pub fn create_all_sql(&self, backend: Backend, if_not_exists: bool) -> Vec<String> {
        self.sorted_tables()
            .into_iter()
            .flat_map(|t| t.create_sql(backend, if_not_exists))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Parent;
    struct Child;

    impl Entity for Parent {
        const TABLE: &'static str = "parent";

        fn table_def() -> TableDef {
            TableDef::new(Self::TABLE)
                .column(ColumnDef::id("id", ColumnType::Integer))
                .column(ColumnDef::new("name", ColumnType::Varchar(50)).not_null())
                .index("ix_parent_name", &["name"], true)
        }
    }

    impl Entity for Child {
        const TABLE: &'static str = "child";

        fn table_def() -> TableDef {
            TableDef::new(Self::TABLE)
                .column(ColumnDef::id("id", ColumnType::Integer))
                .column(
                    ColumnDef::new("parent_id", ColumnType::Integer)
                        .not_null()
                        .references("parent", "id"),
                )
                .column(ColumnDef::new("active", ColumnType::Boolean).not_null().default_sql("true"))
                .unique_together("_child_parent_uc", &["parent_id", "active"])
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = SchemaRegistry::new();
        registry.register::<Parent>().unwrap();
        registry.register::<Parent>().unwrap();
        assert_eq!(registry.table_names(), vec!["parent"]);
    }

    #[test]
    fn test_conflicting_registration_fails() {
        let mut registry = SchemaRegistry::new();
        registry.register::<Parent>().unwrap();
        let other = TableDef::new("parent").column(ColumnDef::id("id", ColumnType::BigInt));
        assert_eq!(
            registry.register_table(other).unwrap_err(),
            SchemaError::ConflictingTable("parent".into())
        );
    }

    #[test]
    fn test_validate_detects_unregistered_reference() {
        let mut registry = SchemaRegistry::new();
        registry.register::<Child>().unwrap();
        assert_eq!(
            registry.validate(),
            Err(SchemaError::UnregisteredReference {
                table: "child".into(),
                target: "parent".into(),
            })
        );

        registry.register::<Parent>().unwrap();
        assert_eq!(registry.validate(), Ok(()));
    }

    #[test]
    fn test_validate_detects_bad_constraint_column() {
        let mut registry = SchemaRegistry::new();
        registry
            .register_table(
                TableDef::new("broken")
                    .column(ColumnDef::id("id", ColumnType::Integer))
                    .unique_together("_broken_uc", &["missing"]),
            )
            .unwrap();
        assert!(matches!(
            registry.validate(),
            Err(SchemaError::UnknownConstraintColumn { .. })
        ));
    }

    #[test]
    fn test_sorted_tables_puts_parents_first() {
        let mut registry = SchemaRegistry::new();
        registry.register::<Child>().unwrap();
        registry.register::<Parent>().unwrap();
        let names: Vec<_> = registry.sorted_tables().iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["parent", "child"]);
    }

    #[test]
    fn test_create_sql_per_backend() {
        let pg = Child::table_def().create_sql(Backend::Postgres, false);
        assert_eq!(pg.len(), 1);
        assert!(pg[0].starts_with("CREATE TABLE child ("));
        assert!(pg[0].contains("id INTEGER GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY"));
        assert!(pg[0].contains("active BOOLEAN NOT NULL DEFAULT true"));
        assert!(pg[0].contains("CONSTRAINT _child_parent_uc UNIQUE (parent_id, active)"));
        assert!(pg[0].contains("FOREIGN KEY (parent_id) REFERENCES parent (id)"));

        let lite = Parent::table_def().create_sql(Backend::Sqlite, true);
        assert_eq!(lite.len(), 2);
        assert!(lite[0].starts_with("CREATE TABLE IF NOT EXISTS parent ("));
        assert!(lite[0].contains("id INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert_eq!(
            lite[1],
            "CREATE UNIQUE INDEX IF NOT EXISTS ix_parent_name ON parent (name)"
        );
    }

    #[test]
    fn test_add_column_sql() {
        let table = Parent::table_def();
        let column = ColumnDef::new("joined", ColumnType::TimestampTz);
        assert_eq!(
            table.add_column_sql(&column, Backend::Postgres),
            "ALTER TABLE parent ADD COLUMN joined TIMESTAMP WITH TIME ZONE"
        );

        let owner = ColumnDef::new("owner_id", ColumnType::Integer).references("parent", "id");
        assert_eq!(
            table.add_column_sql(&owner, Backend::Sqlite),
            "ALTER TABLE parent ADD COLUMN owner_id INTEGER REFERENCES parent (id)"
        );
    }
}
