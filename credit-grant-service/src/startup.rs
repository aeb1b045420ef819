//! Application startup and lifecycle management.

use crate::config::CreditGrantConfig;
use crate::services::{
    get_metrics, init_metrics, Collaborators, CreditGrantService, Database, SystemClock,
};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use service_core::error::AppError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: CreditGrantConfig,
    pub db: Arc<Database>,
    pub credit_grants: CreditGrantService,
}

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    db: Arc<Database>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "credit-grant-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "credit-grant-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Wire every collaborator port to PostgreSQL.
pub fn postgres_collaborators(db: Arc<Database>) -> Collaborators {
    Collaborators {
        grants: db.clone(),
        applications: db.clone(),
        subscriptions: db.clone(),
        plans: db.clone(),
        wallets: db,
        clock: Arc::new(SystemClock),
    }
}

/// Run the periodic sweep of due applications until the task is dropped.
async fn run_sweeper(service: CreditGrantService, interval_secs: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if let Err(e) = service.process_scheduled_applications().await {
            tracing::error!(error = %e, "Credit grant sweep failed");
        }
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: CreditGrantConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: CreditGrantConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: CreditGrantConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);
        let credit_grants =
            CreditGrantService::new(postgres_collaborators(db.clone()), config.processor.clone());

        let state = AppState {
            config: config.clone(),
            db,
            credit_grants,
        };

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Credit grant service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Get the credit grant service backed by this application's database.
    pub fn credit_grants(&self) -> &CreditGrantService {
        &self.state.credit_grants
    }

    /// Run the HTTP server and the sweep loop until either stops.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let health_state = HealthState {
            db: self.state.db.clone(),
        };

        let http_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(health_state);

        let sweep_interval = self.state.config.processor.sweep_interval_secs;
        let sweeper = run_sweeper(self.state.credit_grants.clone(), sweep_interval);

        tracing::info!(
            service = "credit-grant-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            sweep_interval_secs = sweep_interval,
            "Service ready to accept connections"
        );

        tokio::select! {
            result = axum::serve(self.http_listener, http_router) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "HTTP server error");
                    return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
                }
            }
            _ = sweeper => {}
        }

        Ok(())
    }
}
