//! Revision scripts on disk.
//!
//! Each script is a plain SQL file with a small comment header:
//!
//! ```sql
//! -- revision: 4b1f0c2e9a7d
//! -- down_revision: none
//! -- message: create core tables
//! -- created: 2025-09-01T10:00:00+00:00
//!
//! CREATE TABLE source (...);
//! ```
//!
//! `down_revision` names the parent, which links the scripts into one chain.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::error::MigrationError;

const MAX_REVISION_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionScript {
    pub revision: String,
    pub down_revision: Option<String>,
    pub message: String,
    pub created: Option<String>,
    pub sql: String,
    pub path: PathBuf,
}

impl RevisionScript {
    /// A new script chained onto `parent`, with a fresh revision token.
    pub fn new(dir: &Path, parent: Option<&str>, message: &str, sql: String) -> Self {
        let revision = new_revision_id();
        let path = dir.join(format!("{}_{}.sql", revision, slugify(message)));
        Self {
            revision,
            down_revision: parent.map(str::to_string),
            message: message.trim().to_string(),
            created: Some(Utc::now().to_rfc3339()),
            sql,
            path,
        }
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self, MigrationError> {
        let invalid = |reason: String| MigrationError::InvalidScript {
            path: path.to_path_buf(),
            reason,
        };

        let mut revision = None;
        let mut down_revision = None;
        let mut message = String::new();
        let mut created = None;
        let mut body_start = content.len();

        let mut offset = 0;
        for line in content.split_inclusive('\n') {
            let trimmed = line.trim();
            let header = trimmed
                .strip_prefix("--")
                .and_then(|rest| rest.trim().split_once(':'))
                .map(|(key, value)| (key.trim(), value.trim()));

            match header {
                Some(("revision", value)) => revision = Some(value.to_string()),
                Some(("down_revision", value)) => {
                    down_revision = match value {
                        "" | "none" | "None" => Some(None),
                        parent => Some(Some(parent.to_string())),
                    }
                }
                Some(("message", value)) => message = value.to_string(),
                Some(("created", value)) => created = Some(value.to_string()),
                _ if trimmed.is_empty() && revision.is_none() => {}
                _ => {
                    body_start = offset;
                    break;
                }
            }
            offset += line.len();
        }

        let revision = revision.ok_or_else(|| invalid("missing '-- revision:' header".into()))?;
        validate_revision_id(&revision).map_err(invalid)?;

        let down_revision = down_revision
            .ok_or_else(|| invalid("missing '-- down_revision:' header".into()))?;
        if let Some(parent) = &down_revision {
            validate_revision_id(parent).map_err(invalid)?;
            if *parent == revision {
                return Err(invalid("revision cannot be its own parent".into()));
            }
        }

        Ok(Self {
            revision,
            down_revision,
            message,
            created,
            sql: content[body_start..].trim().to_string(),
            path: path.to_path_buf(),
        })
    }

    /// True when the body holds anything besides comments and whitespace.
    pub fn has_statements(&self) -> bool {
        self.sql
            .lines()
            .map(str::trim)
            .any(|line| !line.is_empty() && !line.starts_with("--"))
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "-- revision: {}\n-- down_revision: {}\n-- message: {}\n",
            self.revision,
            self.down_revision.as_deref().unwrap_or("none"),
            self.message
        );
        if let Some(created) = &self.created {
            out.push_str(&format!("-- created: {}\n", created));
        }
        out.push('\n');
        out.push_str(self.sql.trim());
        out.push('\n');
        out
    }

    pub fn write(&self) -> Result<(), MigrationError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|source| MigrationError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        fs::write(&self.path, self.render()).map_err(|source| MigrationError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Reads every `.sql` script in `dir`, sorted by file name.
pub fn load_dir(dir: &Path) -> Result<Vec<RevisionScript>, MigrationError> {
    let io_err = |source| MigrationError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == "sql") {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .iter()
        .map(|path| {
            let content = fs::read_to_string(path).map_err(|source| MigrationError::Io {
                path: path.clone(),
                source,
            })?;
            let script = RevisionScript::parse(path, &content)?;
            debug!(revision = %script.revision, path = %path.display(), "loaded revision script");
            Ok(script)
        })
        .collect()
}

pub fn new_revision_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn validate_revision_id(id: &str) -> Result<(), String> {
    if id.is_empty() || id.len() > MAX_REVISION_LEN {
        return Err(format!(
            "revision '{}' must be 1-{} characters",
            id, MAX_REVISION_LEN
        ));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!(
            "revision '{}' may only contain letters, digits and '_'",
            id
        ));
    }
    Ok(())
}

fn slugify(message: &str) -> String {
    let mut slug = String::new();
    for c in message.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_end_matches('_');
    if slug.is_empty() {
        "revision".to_string()
    } else {
        slug.to_string()
    }
}
