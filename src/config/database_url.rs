use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

/// Database engines the two connection paths know how to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

/// Execution model implied by the driver token of a URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverMode {
    Async,
    Sync,
}

impl Backend {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "postgres" | "postgresql" => Some(Backend::Postgres),
            "sqlite" => Some(Backend::Sqlite),
            _ => None,
        }
    }

    fn drivers(&self) -> &'static [(&'static str, DriverMode)] {
        match self {
            Backend::Postgres => &[
                ("asyncpg", DriverMode::Async),
                ("psycopg2", DriverMode::Sync),
                ("psycopg", DriverMode::Sync),
            ],
            Backend::Sqlite => &[
                ("aiosqlite", DriverMode::Async),
                ("pysqlite", DriverMode::Sync),
            ],
        }
    }

    /// Driver token written into URLs for the given mode.
    pub fn default_driver(&self, mode: DriverMode) -> &'static str {
        match (self, mode) {
            (Backend::Postgres, DriverMode::Async) => "asyncpg",
            (Backend::Postgres, DriverMode::Sync) => "psycopg2",
            (Backend::Sqlite, DriverMode::Async) => "aiosqlite",
            (Backend::Sqlite, DriverMode::Sync) => "pysqlite",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Postgres => write!(f, "postgresql"),
            Backend::Sqlite => write!(f, "sqlite"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DatabaseUrlError {
    #[error("database URL has no scheme")]
    MissingScheme,

    #[error("unsupported database backend '{0}'")]
    UnknownBackend(String),

    #[error("unknown driver '{driver}' for backend '{backend}'")]
    UnknownDriver { backend: String, driver: String },

    #[error("malformed database URL: {0}")]
    Malformed(String),
}

/// A connection string of the form `backend[+driver]:rest`.
///
/// The driver token only selects the execution model. Host, credentials and
/// database live in `rest`, which is shared verbatim between the runtime
/// (async) and migration (sync) renditions of the same URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseUrl {
    raw: String,
    backend_token: String,
    backend: Backend,
    driver: Option<String>,
    rest: String,
}

impl DatabaseUrl {
    pub fn parse(raw: &str) -> Result<Self, DatabaseUrlError> {
        if raw.trim() != raw {
            return Err(DatabaseUrlError::Malformed(
                "leading or trailing whitespace".into(),
            ));
        }
        let colon = raw.find(':').ok_or(DatabaseUrlError::MissingScheme)?;
        let (scheme, rest) = raw.split_at(colon);
        if scheme.is_empty() {
            return Err(DatabaseUrlError::MissingScheme);
        }

        let (backend_token, driver) = match scheme.split_once('+') {
            Some((backend, driver)) => (backend, Some(driver)),
            None => (scheme, None),
        };

        let backend = Backend::from_token(&backend_token.to_ascii_lowercase())
            .ok_or_else(|| DatabaseUrlError::UnknownBackend(backend_token.to_string()))?;

        if let Some(driver) = driver {
            if !backend.drivers().iter().any(|(name, _)| *name == driver) {
                return Err(DatabaseUrlError::UnknownDriver {
                    backend: backend_token.to_string(),
                    driver: driver.to_string(),
                });
            }
        }

        let url = Self {
            raw: raw.to_string(),
            backend_token: backend_token.to_string(),
            backend,
            driver: driver.map(str::to_string),
            rest: rest.to_string(),
        };
        url.validate_location()?;
        Ok(url)
    }

    fn validate_location(&self) -> Result<(), DatabaseUrlError> {
        match self.backend {
            Backend::Postgres => {
                let parsed = Url::parse(&self.connect_url())
                    .map_err(|e| DatabaseUrlError::Malformed(e.to_string()))?;
                if parsed.host_str().map_or(true, str::is_empty) {
                    return Err(DatabaseUrlError::Malformed("missing host".into()));
                }
                if parsed.path().trim_start_matches('/').is_empty() {
                    return Err(DatabaseUrlError::Malformed("missing database name".into()));
                }
                Ok(())
            }
            Backend::Sqlite => {
                if !self.rest.starts_with(':') {
                    return Err(DatabaseUrlError::Malformed(
                        "expected ':' after sqlite scheme".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// The string exactly as configured.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    /// Execution model named by the driver token, `None` for a bare scheme.
    pub fn mode(&self) -> Option<DriverMode> {
        let driver = self.driver.as_deref()?;
        self.backend
            .drivers()
            .iter()
            .find(|(name, _)| *name == driver)
            .map(|(_, mode)| *mode)
    }

    /// Same location with another driver token substituted.
    pub fn with_driver(&self, driver: &str) -> Result<Self, DatabaseUrlError> {
        Self::parse(&format!("{}+{}{}", self.backend_token, driver, self.rest))
    }

    /// The rendition used by the request-handling pool.
    pub fn runtime_url(&self) -> Result<Self, DatabaseUrlError> {
        match self.mode() {
            Some(DriverMode::Async) => Ok(self.clone()),
            _ => self.with_driver(self.backend.default_driver(DriverMode::Async)),
        }
    }

    /// The rendition used by the migration engine.
    pub fn sync_url(&self) -> Result<Self, DatabaseUrlError> {
        match self.mode() {
            Some(DriverMode::Sync) => Ok(self.clone()),
            _ => self.with_driver(self.backend.default_driver(DriverMode::Sync)),
        }
    }

    /// True when both URLs name the same logical database, whatever their
    /// driver tokens.
    pub fn same_database(&self, other: &DatabaseUrl) -> bool {
        self.backend == other.backend && self.rest == other.rest
    }

    /// Driver-free URL understood by sqlx.
    pub fn connect_url(&self) -> String {
        match self.backend {
            Backend::Postgres => format!("postgres{}", self.rest),
            Backend::Sqlite => {
                let location = self.rest.strip_prefix(':').unwrap_or(&self.rest);
                let path = if location == ":memory:" {
                    location
                } else {
                    location
                        .strip_prefix("///")
                        .or_else(|| location.strip_prefix("//"))
                        .unwrap_or(location)
                };
                if path.is_empty() || path == ":memory:" {
                    "sqlite::memory:".to_string()
                } else if path.contains('?') {
                    format!("sqlite:{}", path)
                } else {
                    format!("sqlite:{}?mode=rwc", path)
                }
            }
        }
    }

    /// Connect URL with the password masked, for logs.
    pub fn redacted(&self) -> String {
        let connect = self.connect_url();
        match Url::parse(&connect) {
            Ok(mut parsed) if parsed.password().is_some() => {
                let _ = parsed.set_password(Some("***"));
                parsed.to_string()
            }
            _ => connect,
        }
    }
}

impl FromStr for DatabaseUrl {
    type Err = DatabaseUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DatabaseUrl {
    type Error = DatabaseUrlError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DatabaseUrl> for String {
    fn from(url: DatabaseUrl) -> Self {
        url.raw
    }
}

impl fmt::Display for DatabaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for DatabaseUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DatabaseUrl::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl Serialize for DatabaseUrl {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASYNC_PG: &str = "postgresql+asyncpg://u:p@localhost:5432/testdb";

    #[test]
    fn test_parse_async_postgres() {
        let url = DatabaseUrl::parse(ASYNC_PG).unwrap();
        assert_eq!(url.as_str(), ASYNC_PG);
        assert_eq!(url.backend(), Backend::Postgres);
        assert_eq!(url.driver(), Some("asyncpg"));
        assert_eq!(url.mode(), Some(DriverMode::Async));
        assert_eq!(url.connect_url(), "postgres://u:p@localhost:5432/testdb");
    }

    #[test]
    fn test_sync_url_substitutes_only_the_driver() {
        let url = DatabaseUrl::parse(ASYNC_PG).unwrap();
        let sync = url.sync_url().unwrap();
        assert_eq!(sync.as_str(), "postgresql+psycopg2://u:p@localhost:5432/testdb");
        assert_eq!(sync.mode(), Some(DriverMode::Sync));
        assert!(sync.same_database(&url));
        assert_eq!(sync.connect_url(), url.connect_url());

        let back = sync.runtime_url().unwrap();
        assert_eq!(back.as_str(), ASYNC_PG);
    }

    #[test]
    fn test_bare_scheme_gets_default_drivers() {
        let url = DatabaseUrl::parse("postgres://u:p@db:5432/orca").unwrap();
        assert_eq!(url.mode(), None);
        assert_eq!(url.runtime_url().unwrap().driver(), Some("asyncpg"));
        assert_eq!(url.sync_url().unwrap().driver(), Some("psycopg2"));
    }

    #[test]
    fn test_different_hosts_are_different_databases() {
        let a = DatabaseUrl::parse(ASYNC_PG).unwrap();
        let b = DatabaseUrl::parse("postgresql+psycopg2://u:p@otherhost:5432/testdb").unwrap();
        assert!(!a.same_database(&b));
    }

    #[test]
    fn test_surrounding_whitespace_is_rejected() {
        assert!(matches!(
            DatabaseUrl::parse(" postgresql+asyncpg://u:p@localhost:5432/testdb"),
            Err(DatabaseUrlError::Malformed(_))
        ));
        assert!(matches!(
            DatabaseUrl::parse("sqlite+aiosqlite://\n"),
            Err(DatabaseUrlError::Malformed(_))
        ));
        let exact = DatabaseUrl::parse(ASYNC_PG).unwrap();
        assert_eq!(exact.as_str(), ASYNC_PG);
    }

    #[test]
    fn test_memory_forms_never_touch_disk() {
        for raw in ["sqlite::memory:", "sqlite+aiosqlite::memory:", "sqlite+pysqlite:///:memory:"] {
            let url = DatabaseUrl::parse(raw).unwrap();
            assert_eq!(url.connect_url(), "sqlite::memory:", "{}", raw);
        }
    }

    #[test]
    fn test_sqlite_locations() {
        let memory = DatabaseUrl::parse("sqlite+aiosqlite://").unwrap();
        assert_eq!(memory.connect_url(), "sqlite::memory:");

        let memory = DatabaseUrl::parse("sqlite::memory:").unwrap();
        assert_eq!(memory.connect_url(), "sqlite::memory:");

        let relative = DatabaseUrl::parse("sqlite+aiosqlite:///./orca.db").unwrap();
        assert_eq!(relative.connect_url(), "sqlite:./orca.db?mode=rwc");

        let absolute = DatabaseUrl::parse("sqlite+pysqlite:////var/lib/orca.db").unwrap();
        assert_eq!(absolute.connect_url(), "sqlite:/var/lib/orca.db?mode=rwc");
        assert_eq!(absolute.mode(), Some(DriverMode::Sync));
    }

    #[test]
    fn test_rejects_malformed_urls() {
        assert_eq!(
            DatabaseUrl::parse("no-scheme-here"),
            Err(DatabaseUrlError::MissingScheme)
        );
        assert!(matches!(
            DatabaseUrl::parse("mysql+aiomysql://u:p@localhost/db"),
            Err(DatabaseUrlError::UnknownBackend(_))
        ));
        assert!(matches!(
            DatabaseUrl::parse("postgresql+mystery://u:p@localhost/db"),
            Err(DatabaseUrlError::UnknownDriver { .. })
        ));
        assert!(matches!(
            DatabaseUrl::parse("postgresql+asyncpg://u:p@localhost:notaport/db"),
            Err(DatabaseUrlError::Malformed(_))
        ));
        assert!(matches!(
            DatabaseUrl::parse("postgresql+asyncpg://u:p@localhost:5432/"),
            Err(DatabaseUrlError::Malformed(_))
        ));
    }

    #[test]
    fn test_redacted_hides_password() {
        let url = DatabaseUrl::parse(ASYNC_PG).unwrap();
        let redacted = url.redacted();
        assert!(!redacted.contains(":p@"));
        assert!(redacted.contains("***"));
    }
}
