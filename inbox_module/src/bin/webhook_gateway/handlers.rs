use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio::task;
use tracing::{debug, error, info, warn};

use inbox_module::ingestion::{verify_subscription, IngestError, SignatureError, SIGNATURE_HEADER};

use super::state::GatewayState;

pub(super) async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Deserialize)]
pub(super) struct SubscriptionQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

pub(super) async fn verify_webhook(
    State(state): State<Arc<GatewayState>>,
    Path(platform): Path<String>,
    Query(query): Query<SubscriptionQuery>,
) -> Response {
    match verify_subscription(
        query.mode.as_deref(),
        query.verify_token.as_deref(),
        query.challenge.as_deref(),
        state.verify_token.as_deref(),
    ) {
        Ok(challenge) => {
            info!("webhook subscription verified platform={}", platform);
            (StatusCode::OK, challenge).into_response()
        }
        Err(reason) => {
            warn!("webhook subscription rejected platform={} reason={}", platform, reason);
            (StatusCode::FORBIDDEN, Json(json!({"status": reason}))).into_response()
        }
    }
}

pub(super) async fn receive_webhook(
    State(state): State<Arc<GatewayState>>,
    Path(platform): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let pipeline = state.pipeline.clone();
    let result = task::spawn_blocking(move || pipeline.accept(&body, signature.as_deref())).await;

    let accepted = match result {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(IngestError::Signature(SignatureError::SecretNotConfigured))) => {
            error!("webhook rejected; app secret is not configured platform={}", platform);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "secret_not_configured"})),
            );
        }
        Ok(Err(IngestError::Signature(reason))) => {
            warn!("webhook signature rejected platform={} reason={}", platform, reason);
            return (StatusCode::UNAUTHORIZED, Json(json!({"status": reason.to_string()})));
        }
        Ok(Err(IngestError::InvalidPayload(err))) => {
            warn!("webhook payload rejected platform={} err={}", platform, err);
            return (StatusCode::BAD_REQUEST, Json(json!({"status": "bad_json"})));
        }
        Ok(Err(IngestError::IgnoredObject(object))) => {
            debug!("webhook object ignored platform={} object={}", platform, object);
            return (StatusCode::OK, Json(json!({"status": "ignored"})));
        }
        Ok(Err(err)) => {
            error!("webhook intake failed platform={} err={}", platform, err);
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status": "error"})));
        }
        Err(err) => {
            error!("webhook intake task failed platform={} err={}", platform, err);
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status": "error"})));
        }
    };

    if accepted.duplicate {
        return (
            StatusCode::OK,
            Json(json!({
                "status": "duplicate",
                "raw_event_id": accepted.raw_event.id,
                "job_id": accepted.job_id,
            })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "status": "accepted",
            "raw_event_id": accepted.raw_event.id,
            "job_id": accepted.job_id,
        })),
    )
}
