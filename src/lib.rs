pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod storage;

use axum::{extract::DefaultBodyLimit, handler::Handler, routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::Database;
use crate::services::{ContentLedger, Pipeline, QuotaAccountant, RateLimiter};
use crate::storage::BlobStore;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub pipeline: Pipeline,
    pub quota: QuotaAccountant,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Wire the accounting components. The rate limiter lives as long as this state.
    pub fn new(db: Database, config: Arc<Config>, store: Arc<dyn BlobStore>) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.limits.rate_limit_calls,
            config.limits.rate_limit_window(),
        ));
        let quota = QuotaAccountant::new(db.clone(), config.limits.storage_quota_bytes());
        let ledger = Arc::new(ContentLedger::new(db.clone(), store));
        let pipeline = Pipeline::new(db.clone(), limiter.clone(), ledger, quota.clone());

        Self {
            db,
            config,
            pipeline,
            quota,
            limiter,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Uploads may be as large as the quota allows
    let upload_limit = handlers::file::upload_body_limit(state.quota.limit_bytes());

    // Every route needs a caller identity
    let routes = Router::new()
        .route(
            "/files",
            get(handlers::file::list_files).post(
                handlers::file::upload_file.layer(DefaultBodyLimit::max(upload_limit)),
            ),
        )
        .route("/files/storage_stats", get(handlers::file::storage_stats))
        .route("/files/file_types", get(handlers::file::file_types))
        .route(
            "/files/:id",
            get(handlers::file::get_file).delete(handlers::file::delete_file),
        )
        .route("/files/:id/download", get(handlers::file::download_file))
        .route("/quota", get(handlers::quota::get_quota))
        .route("/rate_limit", get(handlers::quota::get_rate_limit))
        .layer(axum::middleware::from_fn(middleware::owner_middleware));

    Router::new()
        .nest("/api/v1", routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
