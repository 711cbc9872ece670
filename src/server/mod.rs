use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::{MoversResult, Timeframe};

/// Latest published movers result, shared with the cycle loop.
pub type SharedMovers = Arc<RwLock<Option<MoversResult>>>;

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct MoversQuery {
    timeframe: Option<String>,
}

/// Read-only query surface over the latest cycle's output.
pub fn router(state: SharedMovers) -> Router {
    Router::new()
        .route("/futures/movers", get(movers_handler))
        .with_state(state)
}

/// GET /futures/movers?timeframe=10m|30m|1h|2h
///
/// Returns the matching snapshot, or the whole label map when the
/// parameter is omitted. Unknown timeframes are a 400.
async fn movers_handler(
    State(state): State<SharedMovers>,
    Query(query): Query<MoversQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let latest = state.read().await;

    match query.timeframe.as_deref() {
        Some(label) => {
            if Timeframe::from_label(label).is_none() {
                return Err(ApiError::BadRequest(format!(
                    "unknown timeframe: {label}"
                )));
            }
            let snapshot = latest
                .as_ref()
                .and_then(|movers| movers.snapshots.get(label));
            Ok(Json(json!(snapshot)))
        }
        None => {
            let snapshots = latest.as_ref().map(|movers| &movers.snapshots);
            Ok(Json(json!(snapshots)))
        }
    }
}

/// Serve the query surface until the process exits.
pub async fn serve(state: SharedMovers, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Movers API listening on http://{addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
