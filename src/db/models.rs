use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::schema::{ColumnDef, ColumnType, Entity, SchemaError, SchemaRegistry, TableDef};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Option<i32>,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    /// Hashed, never the plain password.
    pub password: String,
    pub is_staff: bool,
    pub is_active: bool,
    pub is_superuser: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub date_joined: DateTime<Utc>,
    pub role: String,
}

impl User {
    pub fn new(username: String, password_hash: String) -> Self {
        Self {
            id: None,
            username,
            first_name: None,
            last_name: None,
            email: None,
            password: password_hash,
            is_staff: false,
            is_active: true,
            is_superuser: false,
            last_login: None,
            date_joined: Utc::now(),
            role: "reviewer".to_string(),
        }
    }
}

impl Entity for User {
    const TABLE: &'static str = "users";

    fn table_def() -> TableDef {
        TableDef::new(Self::TABLE)
            .column(ColumnDef::id("id", ColumnType::Integer))
            .column(ColumnDef::new("username", ColumnType::Varchar(150)).not_null())
            .column(ColumnDef::new("first_name", ColumnType::Varchar(150)))
            .column(ColumnDef::new("last_name", ColumnType::Varchar(150)))
            .column(ColumnDef::new("email", ColumnType::Varchar(254)))
            .column(ColumnDef::new("password", ColumnType::Varchar(256)).not_null())
            .column(ColumnDef::new("is_staff", ColumnType::Boolean).not_null().default_sql("false"))
            .column(ColumnDef::new("is_active", ColumnType::Boolean).not_null().default_sql("true"))
            .column(ColumnDef::new("is_superuser", ColumnType::Boolean).not_null().default_sql("false"))
            .column(ColumnDef::new("last_login", ColumnType::TimestampTz))
            .column(ColumnDef::new("date_joined", ColumnType::TimestampTz).not_null())
            .column(
                ColumnDef::new("role", ColumnType::Varchar(50))
                    .not_null()
                    .default_sql("'reviewer'"),
            )
            .index("ix_users_username", &["username"], true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Option<i32>,
    pub name: Option<String>,
}

impl Entity for Source {
    const TABLE: &'static str = "source";

    fn table_def() -> TableDef {
        TableDef::new(Self::TABLE)
            .column(ColumnDef::id("id", ColumnType::Integer))
            .column(ColumnDef::new("name", ColumnType::Varchar(8)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compound {
    pub id: Option<i32>,
    pub name: String,
    pub source_id: i32,
}

impl Entity for Compound {
    const TABLE: &'static str = "compound";

    fn table_def() -> TableDef {
        TableDef::new(Self::TABLE)
            .column(ColumnDef::id("id", ColumnType::Integer))
            .column(ColumnDef::new("name", ColumnType::Varchar(100)).not_null())
            .column(
                ColumnDef::new("source_id", ColumnType::Integer)
                    .not_null()
                    .references(Source::TABLE, "id"),
            )
            .unique_together("_compound_name_source_uc", &["name", "source_id"])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Study {
    pub id: Option<i32>,
    pub name: String,
    pub compound_id: i32,
}

impl Entity for Study {
    const TABLE: &'static str = "study";

    fn table_def() -> TableDef {
        TableDef::new(Self::TABLE)
            .column(ColumnDef::id("id", ColumnType::Integer))
            .column(ColumnDef::new("name", ColumnType::Varchar(200)).not_null())
            .column(
                ColumnDef::new("compound_id", ColumnType::Integer)
                    .not_null()
                    .references(Compound::TABLE, "id"),
            )
            .unique_together("_study_name_compound_uc", &["name", "compound_id"])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseRelease {
    pub id: Option<i32>,
    pub name: String,
    pub study_id: i32,
}

impl Entity for DatabaseRelease {
    const TABLE: &'static str = "database_release";

    fn table_def() -> TableDef {
        TableDef::new(Self::TABLE)
            .column(ColumnDef::id("id", ColumnType::Integer))
            .column(ColumnDef::new("name", ColumnType::Varchar(100)).not_null())
            .column(
                ColumnDef::new("study_id", ColumnType::Integer)
                    .not_null()
                    .references(Study::TABLE, "id"),
            )
            .unique_together("_dbrelease_name_study_uc", &["name", "study_id"])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingEffort {
    pub id: Option<i32>,
    pub name: String,
    pub database_release_id: i32,
}

impl Entity for ReportingEffort {
    const TABLE: &'static str = "reporting_effort";

    fn table_def() -> TableDef {
        TableDef::new(Self::TABLE)
            .column(ColumnDef::id("id", ColumnType::Integer))
            .column(ColumnDef::new("name", ColumnType::Varchar(100)).not_null())
            .column(
                ColumnDef::new("database_release_id", ColumnType::Integer)
                    .not_null()
                    .references(DatabaseRelease::TABLE, "id"),
            )
            .unique_together("_re_name_dbrel_uc", &["name", "database_release_id"])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Option<i64>,
    pub user_name: Option<String>,
    pub action: Option<String>,
    pub timestamp: Option<String>,
    pub object_type: Option<String>,
    pub object_key: Option<String>,
    pub object_property: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub programming_plan_id: Option<i64>,
}

impl Entity for AuditLog {
    const TABLE: &'static str = "audit_log";

    fn table_def() -> TableDef {
        TableDef::new(Self::TABLE)
            .column(ColumnDef::id("id", ColumnType::BigInt))
            .column(ColumnDef::new("user_name", ColumnType::Varchar(512)))
            .column(ColumnDef::new("action", ColumnType::Varchar(512)))
            .column(ColumnDef::new("timestamp", ColumnType::Varchar(356)))
            .column(ColumnDef::new("object_type", ColumnType::Varchar(512)))
            .column(ColumnDef::new("object_key", ColumnType::Varchar(512)))
            .column(ColumnDef::new("object_property", ColumnType::Varchar(512)))
            .column(ColumnDef::new("old_value", ColumnType::Varchar(2048)))
            .column(ColumnDef::new("new_value", ColumnType::Varchar(2048)))
            .column(ColumnDef::new("programming_plan_id", ColumnType::BigInt))
    }
}

/// Builds the registry of every persisted entity.
///
/// New entity types must be added here, or migrations generated against the
/// registry will silently leave their tables out.
pub fn metadata() -> Result<SchemaRegistry, SchemaError> {
    let mut registry = SchemaRegistry::new();
    registry
        .register::<AuditLog>()?
        .register::<User>()?
        .register::<Source>()?
        .register::<Compound>()?
        .register::<Study>()?
        .register::<DatabaseRelease>()?
        .register::<ReportingEffort>()?;
    registry.validate()?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_registers_every_entity() {
        let registry = metadata().expect("registry should be consistent");
        for table in [
            User::TABLE,
            Source::TABLE,
            Compound::TABLE,
            Study::TABLE,
            DatabaseRelease::TABLE,
            ReportingEffort::TABLE,
            AuditLog::TABLE,
        ] {
            assert!(registry.contains(table), "{} is not registered", table);
        }
        assert_eq!(registry.tables().len(), 7);
    }

    #[test]
    fn test_creation_order_follows_foreign_keys() {
        let registry = metadata().unwrap();
        let order: Vec<_> = registry.sorted_tables().iter().map(|t| t.name).collect();
        let pos = |name: &str| order.iter().position(|t| *t == name).unwrap();
        assert!(pos("source") < pos("compound"));
        assert!(pos("compound") < pos("study"));
        assert!(pos("study") < pos("database_release"));
        assert!(pos("database_release") < pos("reporting_effort"));
    }

    #[test]
    fn test_new_user_defaults() {
        let user = User::new("jdoe".into(), "hashed".into());
        assert!(user.id.is_none());
        assert!(user.is_active);
        assert!(!user.is_staff);
        assert_eq!(user.role, "reviewer");
    }
}
