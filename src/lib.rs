pub mod config;
pub mod db;
pub mod error;
pub mod migrate;

use std::sync::Arc;
use actix_web::{web, HttpResponse};
use tracing::info;

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

use db::{SchemaRegistry, SessionProvider};

/// Health check endpoint handler
/// Reports the server as up together with the current pool usage
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "pool": state.sessions.status(),
    }))
}

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub sessions: SessionProvider,
    pub registry: Arc<SchemaRegistry>,
}

impl AppState {
    /// Builds the session provider and checks that the database answers, so
    /// a bad `DB_URL` stops startup instead of the first request.
    pub async fn new(config: Settings) -> Result<Self> {
        let registry = db::metadata().map_err(|e| AppError::InternalError(e.to_string()))?;
        let sessions = SessionProvider::new(&config)?;

        let mut session = sessions.acquire().await?;
        session.ping().await?;
        drop(session);
        info!(backend = %sessions.backend(), "Database reachable");

        Ok(Self {
            config: Arc::new(config),
            sessions,
            registry: Arc::new(registry),
        })
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sessions.close().await;
        Ok(())
    }
}
