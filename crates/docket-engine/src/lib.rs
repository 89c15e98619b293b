//! The docket engine service.
//!
//! One HTTP surface over the two engines: the receipt ledger (submit,
//! archive, derived-state queries) and the task/lease engine (intake, lease
//! grants, heartbeats, terminal calls). A background reaper detects expired
//! leases and emits policy escalations.
//!
//! Endpoints are semantic; every request authenticates through the Access
//! Gate and runs under the resolved tenant scope.

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use docket_core::validate::{Fault, FaultLayer};
use docket_core::{Error, SizeLimits, TenantAccess};
use docket_ledger::Ledger;
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

use anyhow::Context;

pub mod gate;
pub mod lease;
pub mod reaper;
pub mod receipts;
pub mod tasks;

pub use gate::Gate;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Initial lease duration; tasks may carry their own override.
    pub lease_ttl_seconds: i64,
    /// Hard cap on a lease's lifetime across renewals.
    pub max_lease_lifetime_seconds: i64,
    pub reaper_interval_seconds: u64,
    pub default_max_attempts: i64,
    /// Provenance chain traversal bound.
    pub query_depth_cap: usize,
    /// Per-tenant request budget per minute; 0 disables the limiter.
    pub rate_limit_per_minute: u32,
    /// Escalation target when a task names no retry principal.
    pub default_retry_principal: String,
    pub size_limits: SizeLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_ttl_seconds: 900,
            max_lease_lifetime_seconds: 7200,
            reaper_interval_seconds: 30,
            default_max_attempts: 3,
            query_depth_cap: 1000,
            rate_limit_per_minute: 0,
            default_retry_principal: "system.retry".to_string(),
            size_limits: SizeLimits::default(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub cfg: EngineConfig,
    pub ledger: Ledger,
    pub gate: Gate,
}

#[derive(Debug)]
pub struct EngineServer {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl EngineServer {
    pub async fn start(
        pool: PgPool,
        cfg: EngineConfig,
        access: TenantAccess,
        bind: SocketAddr,
        enable_reaper: bool,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind engine to {bind}"))?;
        let addr = listener.local_addr().context("engine local_addr")?;

        let ledger = Ledger::new(pool.clone(), cfg.size_limits);
        let gate = Gate::new(access, cfg.rate_limit_per_minute);
        let state = Arc::new(AppState {
            pool,
            cfg,
            ledger,
            gate,
        });
        let app = build_router(state.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_engine(
            listener,
            app,
            state,
            shutdown_tx.clone(),
            shutdown_rx,
            enable_reaper,
        ));

        Ok(Self {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join.await.context("join engine task")??;
        Ok(())
    }
}

async fn run_engine(
    listener: TcpListener,
    app: Router,
    state: Arc<AppState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    enable_reaper: bool,
) -> anyhow::Result<()> {
    let mut bg = Vec::<JoinHandle<anyhow::Result<()>>>::new();
    if enable_reaper {
        bg.push(tokio::spawn(reaper::reaper_loop(
            state.clone(),
            shutdown_rx.clone(),
        )));
    }

    let mut server_shutdown = shutdown_rx.clone();
    let server =
        axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
            while !*server_shutdown.borrow() {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
            }
        });

    // The background loops must stop when the server ends, error paths
    // included.
    let server_res = server.await;
    let _ = shutdown_tx.send(true);

    for h in bg {
        let _ = h.await;
    }

    server_res.context("engine serve")?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/receipts", post(receipts::submit))
        .route("/v1/receipts/:receipt_id", get(receipts::fetch))
        .route("/v1/receipts/:receipt_id/archive", post(receipts::archive))
        .route("/v1/receipts/:receipt_id/chain", get(receipts::chain))
        .route("/v1/inbox/:recipient_ai", get(receipts::inbox))
        .route("/v1/tasks", post(tasks::submit).get(tasks::list))
        .route("/v1/tasks/:task_id", get(tasks::fetch))
        .route("/v1/tasks/:task_id/timeline", get(receipts::timeline))
        .route("/v1/tasks/:task_id/status", get(receipts::derived_status))
        .route("/v1/lease/next", post(lease::next))
        .route("/v1/lease/heartbeat", post(lease::heartbeat))
        .route("/v1/lease/complete", post(lease::complete))
        .route("/v1/lease/fail", post(lease::fail))
        .route("/v1/lease/release", post(lease::release))
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Transport-facing error: an HTTP status plus the structured fault list of
/// the error contract. Every body is `{"errors": [{code, layer, path,
/// message, hint?}]}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    errors: Vec<Fault>,
}

impl ApiError {
    pub fn new(status: StatusCode, errors: Vec<Fault>) -> Self {
        Self { status, errors }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    fn single(status: StatusCode, code: &str, layer: FaultLayer, message: impl Into<String>) -> Self {
        Self {
            status,
            errors: vec![Fault::new(code, layer, "", message)],
        }
    }

    pub fn validation(errors: Vec<Fault>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            errors,
        }
    }

    pub fn conflict(code: &str, message: impl Into<String>) -> Self {
        Self::single(StatusCode::CONFLICT, code, FaultLayer::Engine, message)
    }

    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        tracing::error!(
            event = "docket.engine.internal_error",
            error = %err,
            "engine internal error"
        );
        Self::single(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            FaultLayer::Engine,
            "internal error",
        )
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        if let Some(first) = self.errors.first_mut() {
            first.hint = Some(hint.into());
        }
        self
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let code = err.code();
        match err {
            Error::Validation(faults) => ApiError::validation(faults),
            Error::SizeLimitExceeded(path) => ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                vec![Fault::new(
                    code,
                    FaultLayer::Size,
                    path,
                    "payload exceeds the size cap",
                )],
            ),
            Error::Duplicate { receipt_id } => ApiError::single(
                StatusCode::CONFLICT,
                code,
                FaultLayer::Engine,
                format!("receipt {receipt_id} already exists with a different payload"),
            ),
            Error::NotFound => ApiError::single(
                StatusCode::NOT_FOUND,
                code,
                FaultLayer::Engine,
                "not found within the tenant",
            ),
            Error::LeaseExpired => ApiError::single(
                StatusCode::CONFLICT,
                code,
                FaultLayer::Engine,
                "lease expired",
            ),
            Error::LeaseNotOwned => ApiError::single(
                StatusCode::CONFLICT,
                code,
                FaultLayer::Engine,
                "lease not owned by caller",
            ),
            Error::LeaseReleased => ApiError::single(
                StatusCode::CONFLICT,
                code,
                FaultLayer::Engine,
                "lease already released",
            ),
            Error::Unauthenticated(reason) => ApiError::single(
                StatusCode::UNAUTHORIZED,
                code,
                FaultLayer::Gate,
                reason,
            ),
            Error::TenantUnresolved => ApiError::single(
                StatusCode::UNAUTHORIZED,
                code,
                FaultLayer::Gate,
                "no tenant resolvable for the authenticated subject",
            ),
            Error::RateLimited => ApiError::single(
                StatusCode::TOO_MANY_REQUESTS,
                code,
                FaultLayer::Gate,
                "rate limit exceeded",
            ),
            Error::StoreUnavailable(source) => {
                tracing::error!(
                    event = "docket.engine.store_unavailable",
                    error = %source,
                    "store unavailable"
                );
                ApiError::single(
                    StatusCode::SERVICE_UNAVAILABLE,
                    code,
                    FaultLayer::Store,
                    "store unavailable; retry with backoff",
                )
            }
            Error::Conflict(message) => {
                ApiError::single(StatusCode::CONFLICT, code, FaultLayer::Engine, message)
            }
            Error::Internal(source) => ApiError::internal(source),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(serde_json::json!({ "errors": self.errors }));
        (self.status, body).into_response()
    }
}
