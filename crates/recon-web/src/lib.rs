//! HTTP wrapper around a single comparison run.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use recon_compare::{run_compare, ReconConfig, RunSummary, Secrets};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "recon-web";

/// Runs one comparison with request-supplied secrets.
#[async_trait]
pub trait CompareRunner: Send + Sync {
    async fn run(&self, secrets: Secrets) -> anyhow::Result<RunSummary>;
}

/// Reads configuration from the environment on every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCompareRunner;

#[async_trait]
impl CompareRunner for EnvCompareRunner {
    async fn run(&self, secrets: Secrets) -> anyhow::Result<RunSummary> {
        let config = ReconConfig::from_env()?;
        run_compare(&config, &secrets).await
    }
}

#[derive(Clone)]
pub struct AppState {
    runner: Arc<dyn CompareRunner>,
}

impl AppState {
    pub fn new(runner: Arc<dyn CompareRunner>) -> Self {
        Self { runner }
    }

    pub fn from_env() -> Self {
        Self::new(Arc::new(EnvCompareRunner))
    }
}

#[derive(Debug, Default, Deserialize)]
struct CompareQuery {
    dbpassword: Option<String>,
    enterprisetoken: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness_handler))
        .route("/compare", post(compare_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

pub async fn serve(host: &str, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    info!(host, port, "listening");
    axum::serve(listener, app(AppState::from_env())).await?;
    Ok(())
}

async fn liveness_handler() -> Response {
    (
        StatusCode::CREATED,
        Json(json!({"status": "up and beating", "timestamp": Utc::now().to_rfc3339()})),
    )
        .into_response()
}

async fn compare_handler(
    State(state): State<AppState>,
    Query(query): Query<CompareQuery>,
) -> Response {
    let present = |value: Option<String>| value.filter(|v| !v.is_empty());
    let (Some(warehouse_password), Some(reporting_token)) =
        (present(query.dbpassword), present(query.enterprisetoken))
    else {
        return failure(StatusCode::BAD_REQUEST, "missing arguments to request".to_string());
    };

    let secrets = Secrets {
        warehouse_password,
        reporting_token,
    };
    match state.runner.run(secrets).await {
        Ok(summary) => (
            StatusCode::OK,
            Json(json!({"status": "success", "message": "success", "comparison": summary})),
        )
            .into_response(),
        Err(err) => {
            error!(error = ?err, "comparison failed");
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("comparison failed. {err:?}. check logs"),
            )
        }
    }
}

async fn not_found_handler() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": "Not found"}))).into_response()
}

fn failure(status: StatusCode, message: String) -> Response {
    (status, Json(json!({"status": "failure", "message": message}))).into_response()
}
