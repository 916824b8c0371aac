//! HTTP trigger surface for the reconciliation job.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use opar_client::CampaignApi;
use opar_core::{RunReport, RunStatus, WindowParams};
use opar_store::LeadStore;
use opar_sync::{ReconcileJob, RunError, RunParams};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "opar-web";

pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

pub struct AppState<C, S> {
    pub job: Arc<ReconcileJob<C, S>>,
    pub internal_token: String,
}

#[derive(Debug, Deserialize, Default)]
struct TriggerQuery {
    date_from: Option<String>,
    date_to: Option<String>,
    days_back: Option<String>,
    dry_run: Option<String>,
    campaign_id: Option<String>,
}

pub fn app<C, S>(state: Arc<AppState<C, S>>) -> Router
where
    C: CampaignApi + 'static,
    S: LeadStore + 'static,
{
    Router::new()
        .route(
            "/jobs/persona-attribution",
            post(trigger_handler::<C, S>).options(preflight_handler),
        )
        .route("/healthz", get(health_handler))
        .with_state(state)
}

pub async fn serve<C, S>(state: Arc<AppState<C, S>>, port: u16) -> anyhow::Result<()>
where
    C: CampaignApi + 'static,
    S: LeadStore + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "trigger surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn trigger_handler<C, S>(
    State(state): State<Arc<AppState<C, S>>>,
    headers: HeaderMap,
    Query(query): Query<TriggerQuery>,
) -> Response
where
    C: CampaignApi + 'static,
    S: LeadStore + 'static,
{
    let request_id = Uuid::new_v4();

    if !authorized(&headers, &state.internal_token) {
        return error_response(
            StatusCode::UNAUTHORIZED,
            request_id,
            "missing or invalid internal token",
        );
    }

    let params = match parse_params(&query) {
        Ok(params) => params,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, request_id, &message),
    };

    match state.job.run(&params).await {
        Ok(report) => run_response(request_id, &report),
        Err(RunError::InvalidParams(err)) => {
            error_response(StatusCode::BAD_REQUEST, request_id, &err.to_string())
        }
        Err(RunError::WindowLocked(window)) => error_response(
            StatusCode::CONFLICT,
            request_id,
            &format!("a reconciliation for {window} is already running"),
        ),
        Err(err) => {
            error!(%request_id, %err, "reconciliation run failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, request_id, "internal error")
        }
    }
}

async fn preflight_handler() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                "content-type, x-internal-token",
            ),
        ],
    )
        .into_response()
}

async fn health_handler() -> Response {
    Json(serde_json::json!({"status": "ok"})).into_response()
}

fn authorized(headers: &HeaderMap, internal_token: &str) -> bool {
    if internal_token.is_empty() {
        return false;
    }
    headers
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == internal_token)
        .unwrap_or(false)
}

fn parse_params(query: &TriggerQuery) -> Result<RunParams, String> {
    let days_back = match &query.days_back {
        Some(raw) => Some(
            raw.parse::<i64>()
                .map_err(|_| format!("days_back must be an integer, got {raw:?}"))?,
        ),
        None => None,
    };
    Ok(RunParams {
        window: WindowParams {
            date_from: query.date_from.clone(),
            date_to: query.date_to.clone(),
            days_back,
        },
        dry_run: query.dry_run.is_some(),
        campaign_id: query.campaign_id.clone().filter(|id| !id.is_empty()),
    })
}

fn run_response(request_id: Uuid, report: &RunReport) -> Response {
    let status = match report.status {
        RunStatus::Partial => StatusCode::MULTI_STATUS,
        _ => StatusCode::OK,
    };
    (
        status,
        Json(serde_json::json!({
            "status": report.status,
            "dry_run": report.dry_run,
            "request_id": request_id,
            "metrics": {
                "range": report.window.label(),
                "events": report.stats,
                "leads_found": report.leads_found,
                "leads_updated": report.merge.updated,
                "leads_skipped": report.merge.skipped,
                "missing_leads": report.merge.missing,
                "update_errors": report.merge.errors,
                "runtime_ms": report.runtime_ms,
            },
        })),
    )
        .into_response()
}

fn error_response(status: StatusCode, request_id: Uuid, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "status": "error",
            "request_id": request_id,
            "error": message,
        })),
    )
        .into_response()
}
