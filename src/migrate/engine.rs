//! Synchronous engine for the migration process.
//!
//! The migration runner is a one-shot, sequential program. Instead of a pool
//! it holds exactly one connection, driven to completion by a private
//! current-thread runtime, so every call blocks until the database answers.
//! It shares nothing with the runtime session pool except the connection
//! string, which it reads through its sync-driver rendition.
//!
//! Calling into a `SyncEngine` from inside an async runtime panics; it is
//! meant for `main` of the migrate binary and for plain `#[test]`s.

use std::str::FromStr;

use sqlx::any::AnyConnectOptions;
use sqlx::{Any, AnyConnection, Connection, Executor, Row, Transaction};
use tokio::runtime::{Builder, Runtime};
use tracing::{info, warn};

use crate::config::{Backend, DatabaseUrl, Settings};
use crate::error::MigrationError;

pub struct SyncEngine {
    url: DatabaseUrl,
    runtime: Runtime,
    conn: AnyConnection,
}

impl SyncEngine {
    /// Connects with the sync-driver rendition of the configured `db_url`.
    pub fn connect(settings: &Settings) -> Result<Self, MigrationError> {
        let url = settings.db_url.sync_url()?;
        Self::connect_url(&url)
    }

    pub fn connect_url(url: &DatabaseUrl) -> Result<Self, MigrationError> {
        sqlx::any::install_default_drivers();

        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(MigrationError::Runtime)?;

        // Statement logging stays on: every DDL statement is worth a log line.
        let options = AnyConnectOptions::from_str(&url.connect_url())?;
        let conn = runtime.block_on(AnyConnection::connect_with(&options))?;
        info!(url = %url.redacted(), "Migration engine connected");

        Ok(Self {
            url: url.clone(),
            runtime,
            conn,
        })
    }

    pub fn url(&self) -> &DatabaseUrl {
        &self.url
    }

    pub fn backend(&self) -> Backend {
        self.url.backend()
    }

    /// Executes one or more statements outside any explicit transaction.
    pub fn execute(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        let result = self.runtime.block_on((&mut self.conn).execute(sql))?;
        Ok(result.rows_affected())
    }

    /// Runs a query whose columns are all text and collects the rows.
    pub fn fetch_text_rows(&mut self, sql: &str) -> Result<Vec<Vec<String>>, sqlx::Error> {
        let rows = self
            .runtime
            .block_on(sqlx::query(sql).fetch_all(&mut self.conn))?;
        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.try_get::<String, _>(i))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect()
    }

    /// Runs `work` inside one transaction. `Ok` commits; `Err` rolls back and
    /// returns the original error.
    pub fn transaction<T, F>(&mut self, work: F) -> Result<T, MigrationError>
    where
        F: FnOnce(&mut SyncTransaction<'_, '_>) -> Result<T, MigrationError>,
    {
        let runtime = &self.runtime;
        let mut tx = runtime.block_on(Connection::begin(&mut self.conn))?;

        let outcome = work(&mut SyncTransaction {
            runtime,
            tx: &mut tx,
        });

        match outcome {
            Ok(value) => {
                runtime.block_on(tx.commit())?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = runtime.block_on(tx.rollback()) {
                    warn!(error = %rollback, "Rollback after failed migration step also failed");
                }
                Err(e)
            }
        }
    }

    pub fn close(self) -> Result<(), MigrationError> {
        let SyncEngine { runtime, conn, .. } = self;
        runtime.block_on(conn.close())?;
        Ok(())
    }
}

/// Blocking view of an open transaction on the migration connection.
pub struct SyncTransaction<'a, 'c> {
    runtime: &'a Runtime,
    tx: &'a mut Transaction<'c, Any>,
}

impl SyncTransaction<'_, '_> {
    pub fn execute(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        let conn: &mut AnyConnection = &mut **self.tx;
        let result = self.runtime.block_on(conn.execute(sql))?;
        Ok(result.rows_affected())
    }

    /// Executes a statement with a single text parameter bound to `$1`.
    pub fn execute_with(&mut self, sql: &str, value: &str) -> Result<u64, sqlx::Error> {
        let conn: &mut AnyConnection = &mut **self.tx;
        let result = self
            .runtime
            .block_on(sqlx::query(sql).bind(value.to_string()).execute(conn))?;
        Ok(result.rows_affected())
    }

    pub fn fetch_optional_text(&mut self, sql: &str) -> Result<Option<String>, sqlx::Error> {
        let conn: &mut AnyConnection = &mut **self.tx;
        let row = self.runtime.block_on(sqlx::query(sql).fetch_optional(conn))?;
        row.map(|row| row.try_get::<String, _>(0)).transpose()
    }
}
