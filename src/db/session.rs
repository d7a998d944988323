//! Runtime session provider.
//!
//! One [`SessionProvider`] is built per process from the loaded settings. Each
//! unit of work (usually one HTTP request) calls [`SessionProvider::acquire`]
//! and gets its own [`Session`]. Dropping the session releases its pooled
//! connection and its capacity slot, on every exit path: normal return, `?`
//! propagation, panic, or the request future being cancelled.
//!
//! Capacity is capped at `pool.max_connections`. When every slot is checked
//! out, acquisition either waits for a release ([`AcquirePolicy::Block`], the
//! default) or gives up after a fixed budget with
//! [`DatabaseError::PoolExhausted`] ([`AcquirePolicy::Timeout`]).

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::{dev::Payload, web, FromRequest, HttpRequest};
use futures::future::LocalBoxFuture;
use serde::Serialize;
use sqlx::any::{AnyConnectOptions, AnyPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyConnection, AnyPool, ConnectOptions, Connection, Executor, Transaction};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Backend, DatabaseUrl, Settings};
use crate::db::schema::SchemaRegistry;
use crate::error::{AppError, DatabaseError};
use crate::AppState;

/// What a caller experiences when every session is checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePolicy {
    /// Suspend until another unit of work releases its session.
    Block,
    /// Wait at most this long, then fail with `PoolExhausted`.
    Timeout(Duration),
}

impl AcquirePolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        settings
            .pool
            .acquire_timeout()
            .map_or(AcquirePolicy::Block, AcquirePolicy::Timeout)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub capacity: u32,
    pub checked_out: usize,
    pub available: usize,
    pub open_connections: u32,
    pub idle_connections: usize,
}

#[derive(Clone)]
pub struct SessionProvider {
    pool: AnyPool,
    permits: Arc<Semaphore>,
    checked_out: Arc<AtomicUsize>,
    capacity: u32,
    policy: AcquirePolicy,
    url: DatabaseUrl,
}

impl SessionProvider {
    /// Builds the pool from the runtime rendition of `db_url`.
    ///
    /// No connection is opened here; an unreachable database surfaces on the
    /// first `acquire`.
    pub fn new(settings: &Settings) -> crate::Result<Self> {
        sqlx::any::install_default_drivers();

        let url = settings.db_url.runtime_url()?;
        let mut options = AnyConnectOptions::from_str(&url.connect_url())?;
        if !settings.debug {
            options = options.disable_statement_logging();
        }

        let capacity = settings.pool.max_connections;
        let pool = AnyPoolOptions::new()
            .max_connections(capacity)
            .acquire_timeout(settings.pool.connect_timeout())
            .connect_lazy_with(options);

        let policy = AcquirePolicy::from_settings(settings);
        info!(
            url = %url.redacted(),
            capacity,
            policy = ?policy,
            "Session provider initialized"
        );

        Ok(Self {
            pool,
            permits: Arc::new(Semaphore::new(capacity as usize)),
            checked_out: Arc::new(AtomicUsize::new(0)),
            capacity,
            policy,
            url,
        })
    }

    pub fn backend(&self) -> Backend {
        self.url.backend()
    }

    pub fn policy(&self) -> AcquirePolicy {
        self.policy
    }

    /// Checks out a session for one unit of work.
    pub async fn acquire(&self) -> Result<Session, DatabaseError> {
        let started = Instant::now();
        let permit = self.reserve(started).await?;

        let conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Failed to open database connection");
                return Err(match e {
                    sqlx::Error::PoolClosed => DatabaseError::PoolClosed,
                    other => DatabaseError::ConnectionError(other.to_string()),
                });
            }
        };

        let id = Uuid::new_v4();
        let in_use = self.checked_out.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            session = %id,
            in_use,
            waited_ms = started.elapsed().as_millis() as u64,
            "Session acquired"
        );

        Ok(Session {
            id,
            conn,
            lease: Lease {
                session: id,
                checked_out: self.checked_out.clone(),
            },
            _permit: permit,
        })
    }

    async fn reserve(&self, started: Instant) -> Result<OwnedSemaphorePermit, DatabaseError> {
        if self.permits.available_permits() == 0 {
            debug!(capacity = self.capacity, "All sessions in use, waiting");
        }

        let wait = self.permits.clone().acquire_owned();
        match self.policy {
            AcquirePolicy::Block => wait.await.map_err(|_| DatabaseError::PoolClosed),
            AcquirePolicy::Timeout(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(permit) => permit.map_err(|_| DatabaseError::PoolClosed),
                Err(_) => {
                    let waited = started.elapsed();
                    warn!(
                        capacity = self.capacity,
                        waited_ms = waited.as_millis() as u64,
                        "Session pool exhausted"
                    );
                    Err(DatabaseError::PoolExhausted {
                        capacity: self.capacity,
                        waited,
                    })
                }
            },
        }
    }

    /// Runs `work` with a fresh session. The session is released when `work`
    /// finishes, whatever its outcome.
    pub async fn with_session<F, Fut, T>(&self, work: F) -> crate::Result<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let session = self.acquire().await?;
        work(session).await
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            capacity: self.capacity,
            checked_out: self.checked_out.load(Ordering::SeqCst),
            available: self.permits.available_permits(),
            open_connections: self.pool.size(),
            idle_connections: self.pool.num_idle(),
        }
    }

    /// Creates every registered table that does not exist yet.
    ///
    /// Meant for development databases; migrations remain the source of
    /// truth for shared environments.
    pub async fn init_schema(&self, registry: &SchemaRegistry) -> crate::Result<usize> {
        let statements = registry.create_all_sql(self.backend(), true);
        let mut session = self.acquire().await?;
        let mut tx = session.begin().await?;
        for statement in &statements {
            (&mut *tx).execute(statement.as_str()).await?;
        }
        tx.commit().await?;
        info!(tables = registry.tables().len(), "Schema initialized");
        Ok(statements.len())
    }

    /// Refuses new sessions and closes idle connections. Sessions already
    /// checked out finish normally.
    pub async fn close(&self) {
        self.permits.close();
        self.pool.close().await;
        info!("Session provider closed");
    }
}

/// Returns the checked-out count exactly once, when the owning session drops.
struct Lease {
    session: Uuid,
    checked_out: Arc<AtomicUsize>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let remaining = self.checked_out.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(session = %self.session, in_use = remaining, "Session released");
    }
}

/// One checked-out connection bound to one unit of work.
///
/// Derefs to the underlying connection, so it can be passed anywhere sqlx
/// expects an executor: `sqlx::query(..).fetch_one(&mut *session)`.
pub struct Session {
    id: Uuid,
    conn: PoolConnection<Any>,
    lease: Lease,
    _permit: OwnedSemaphorePermit,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn ping(&mut self) -> Result<(), DatabaseError> {
        (&mut *self.conn).execute("SELECT 1").await?;
        Ok(())
    }

    pub async fn begin(&mut self) -> Result<Transaction<'_, Any>, DatabaseError> {
        Ok(Connection::begin(&mut *self.conn).await?)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("lease", &self.lease.session)
            .finish()
    }
}

impl Deref for Session {
    type Target = AnyConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for Session {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

/// Gives every request handler that asks for it a session of its own.
impl FromRequest for Session {
    type Error = AppError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let sessions = req
            .app_data::<web::Data<AppState>>()
            .map(|state| state.sessions.clone());

        Box::pin(async move {
            let sessions = sessions.ok_or_else(|| {
                AppError::InternalError("application state is not configured".to_string())
            })?;
            Ok(sessions.acquire().await?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let mut vars: HashMap<String, String> = HashMap::from([
            ("DB_URL".to_string(), "sqlite+aiosqlite://".to_string()),
            ("DEBUG".to_string(), "false".to_string()),
        ]);
        for (k, v) in pairs {
            vars.insert(k.to_string(), v.to_string());
        }
        Settings::from_env_map(vars).expect("Failed to load test config")
    }

    #[test]
    fn test_policy_from_settings() {
        assert_eq!(AcquirePolicy::from_settings(&settings(&[])), AcquirePolicy::Block);
        assert_eq!(
            AcquirePolicy::from_settings(&settings(&[("POOL__ACQUIRE_TIMEOUT_SECS", "2")])),
            AcquirePolicy::Timeout(Duration::from_secs(2))
        );
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let provider = SessionProvider::new(&settings(&[("POOL__MAX_CONNECTIONS", "3")])).unwrap();
        let before = provider.status();
        assert_eq!(before.checked_out, 0);
        assert_eq!(before.available, 3);

        let mut session = provider.acquire().await.expect("acquire");
        session.ping().await.expect("ping");
        assert_eq!(provider.status().checked_out, 1);
        assert_eq!(provider.status().available, 2);

        drop(session);
        let after = provider.status();
        assert_eq!(after.checked_out, 0);
        assert_eq!(after.available, 3);
    }

    #[tokio::test]
    async fn test_released_after_error_in_scope() {
        let provider = SessionProvider::new(&settings(&[("POOL__MAX_CONNECTIONS", "1")])).unwrap();

        let result: crate::Result<()> = provider
            .with_session(|mut session| async move {
                session.ping().await?;
                sqlx::query("SELECT * FROM no_such_table")
                    .fetch_all(&mut *session)
                    .await?;
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(AppError::DatabaseError(DatabaseError::QueryError(_)))
        ));
        let status = provider.status();
        assert_eq!(status.checked_out, 0);
        assert_eq!(status.available, 1);
    }

    #[tokio::test]
    async fn test_closed_provider_refuses_sessions() {
        let provider = SessionProvider::new(&settings(&[])).unwrap();
        provider.close().await;
        assert!(matches!(provider.acquire().await, Err(DatabaseError::PoolClosed)));
    }
}
