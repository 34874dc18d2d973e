//! API route handlers.

use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::de::DeserializeOwned;
use tracing::debug;

use trawl_core::query::now_ms;
use trawl_core::TrafficRecord;
use trawl_proxy::{SessionStatus, StartResult, StopResult};

use crate::error::{ApiError, Result};
use crate::models::{
    ClearParams, ClearResponse, HealthResponse, StartRequest, StopRequest, TrafficParams,
    TrafficResponse,
};
use crate::state::AppState;

/// Parses an optional JSON body. An empty body yields the default.
fn parse_body<T: DeserializeOwned + Default>(session_id: &str, body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(session_id, e.to_string()))
}

fn parse_query<T>(
    session_id: &str,
    query: std::result::Result<Query<T>, QueryRejection>,
) -> Result<T> {
    query
        .map(|Query(params)| params)
        .map_err(|e| ApiError::bad_request(session_id, e.body_text()))
}

/// GET /api/health - Liveness and tracked session count.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_sessions: state.manager.session_ids().await.len(),
    })
}

/// POST /api/sessions/{id}/proxy/start - Launch the capture proxy.
pub async fn start_proxy(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<Json<StartResult>> {
    let req: StartRequest = parse_body(&session_id, &body)?;
    debug!(session_id = %session_id, port = ?req.port, "Start requested");

    let result = state
        .manager
        .start(&session_id, req.port, req.listen_host)
        .await?;
    Ok(Json(result))
}

/// POST /api/sessions/{id}/proxy/stop - Stop the capture proxy.
pub async fn stop_proxy(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<Json<StopResult>> {
    let req: StopRequest = parse_body(&session_id, &body)?;
    let keep_data = req.keep_data.unwrap_or(true);
    debug!(session_id = %session_id, keep_data, "Stop requested");

    let result = state.manager.stop(&session_id, keep_data).await?;
    Ok(Json(result))
}

/// GET /api/sessions/{id}/proxy/status - Session snapshot with traffic stats.
pub async fn proxy_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatus>> {
    Ok(Json(state.manager.status(&session_id).await?))
}

/// GET /api/sessions/{id}/traffic - Filtered, paginated traffic.
pub async fn query_traffic(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    params: std::result::Result<Query<TrafficParams>, QueryRejection>,
) -> Result<Json<TrafficResponse>> {
    let query = parse_query(&session_id, params)?
        .into_query(now_ms())
        .map_err(|e| ApiError::query(&session_id, e))?;
    let page = state.manager.query(&session_id, &query).await?;

    debug!(
        session_id = %session_id,
        total_matches = page.total_matches,
        returned = page.entries.len(),
        "Traffic queried"
    );
    Ok(Json(TrafficResponse::new(session_id, &query, page)))
}

/// GET /api/sessions/{id}/traffic/{entry_id} - One exchange with bodies.
pub async fn get_traffic_entry(
    State(state): State<AppState>,
    Path((session_id, entry_id)): Path<(String, String)>,
) -> Result<Json<TrafficRecord>> {
    match state.manager.get_entry(&session_id, &entry_id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(ApiError::EntryNotFound {
            session_id,
            entry_id,
        }),
    }
}

/// DELETE /api/sessions/{id}/traffic - Drop old or all captured traffic.
pub async fn clear_traffic(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    params: std::result::Result<Query<ClearParams>, QueryRejection>,
) -> Result<Json<ClearResponse>> {
    let threshold = parse_query(&session_id, params)?
        .threshold_ms(now_ms())
        .map_err(|e| ApiError::query(&session_id, e))?;
    let outcome = state.manager.clear(&session_id, threshold).await?;
    Ok(Json(outcome.into()))
}
