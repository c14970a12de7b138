//! HTTP endpoints: the SSRF-safe proxy and task submission.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::dispatch::DispatchError;
use crate::fetch::FetchError;
use crate::protocol::{TaskAccepted, TaskRequest};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    pub url: Option<String>,
}

/// Fetch a third-party URL on behalf of the caller.
///
/// GET /proxy?url=<encoded URL>
///
/// Returns `{status, size, body}` with the upstream status passed through.
pub async fn proxy(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ProxyQuery>,
) -> Response {
    let Some(url) = params.url.filter(|u| !u.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing url").into_response();
    };

    match state.fetcher.fetch(&url).await {
        Ok(result) => {
            tracing::debug!(url = %url, status = result.status, size = result.size, "Proxied");
            Json(result).into_response()
        }
        Err(e) => {
            tracing::warn!(url = %url, "Proxy request failed: {}", e);
            e.into_response()
        }
    }
}

/// Dispatch a task to one agent.
///
/// POST /tasks with `{sessionId, type, payload}`
///
/// Returns `{ok: true, taskId}`.
pub async fn enqueue_task(
    State(state): State<Arc<AppState>>,
    body: Result<Json<TaskRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return (StatusCode::BAD_REQUEST, "bad json").into_response();
    };

    match state
        .dispatcher
        .enqueue_task(&request.session_id, &request.task_type, request.payload)
        .await
    {
        Ok(task_id) => Json(TaskAccepted { ok: true, task_id }).into_response(),
        Err(e) => e.into_response(),
    }
}

impl IntoResponse for FetchError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            FetchError::BadUrl(_) => (StatusCode::BAD_REQUEST, "bad url"),
            FetchError::ForbiddenHost(_) | FetchError::ForbiddenRedirect(_) => {
                (StatusCode::FORBIDDEN, "host not allowed")
            }
            FetchError::TooManyRedirects(_) => (StatusCode::BAD_GATEWAY, "too many redirects"),
            FetchError::UpstreamTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "upstream timeout"),
            FetchError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream error"),
        };
        (status, msg).into_response()
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            DispatchError::Validation => (StatusCode::BAD_REQUEST, "sessionId/type required"),
            DispatchError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "session not found"),
            DispatchError::Delivery(_) => (StatusCode::BAD_GATEWAY, "send failed"),
        };
        (status, msg).into_response()
    }
}
