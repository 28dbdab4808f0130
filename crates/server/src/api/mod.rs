use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use server_api::{
    auth_login_route, auth_register_route, feed_snapshot, login, publish_ride_request, register,
    verify_session_token, verify_token, VerifiedToken,
};
use shared::{
    domain::{AuthIdentity, RideRequest},
    error::{ApiError, ErrorCode},
    protocol::{AuthGrant, CredentialsRequest, FeedSnapshot, PublishRideRequest, ServerEvent},
};
use tokio::sync::broadcast::error::RecvError;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::app_state::{AppState, FeedChanged};

const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024;

type ApiRejection = (StatusCode, Json<ApiError>);

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    token: String,
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(auth_register_route(), post(http_register))
        .route(auth_login_route(), post(http_login))
        .route("/messages", post(http_publish).get(http_snapshot))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub(crate) fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> ApiRejection {
    (status_for(err.code), Json(err))
}

fn bearer_identity(state: &AppState, headers: &HeaderMap) -> Result<AuthIdentity, ApiRejection> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            reject(ApiError::new(
                ErrorCode::Unauthorized,
                "missing bearer token",
            ))
        })?;
    verify_token(&state.api, token).map_err(reject)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok("ok")
}

async fn http_register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<AuthGrant>, ApiRejection> {
    let grant = register(&state.api, &req.email, &req.password)
        .await
        .map_err(reject)?;
    Ok(Json(grant))
}

async fn http_login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<AuthGrant>, ApiRejection> {
    let grant = login(&state.api, &req.email, &req.password)
        .await
        .map_err(reject)?;
    Ok(Json(grant))
}

async fn http_publish(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PublishRideRequest>,
) -> Result<Json<RideRequest>, ApiRejection> {
    let identity = bearer_identity(&state, &headers)?;
    let stored = publish_ride_request(&state.api, &identity, req)
        .await
        .map_err(reject)?;
    let _ = state.feed_changed.send(FeedChanged);
    Ok(Json(stored))
}

async fn http_snapshot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<FeedSnapshot>, ApiRejection> {
    bearer_identity(&state, &headers)?;
    let snapshot = feed_snapshot(&state.api).await.map_err(reject)?;
    Ok(Json(snapshot))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Response {
    match verify_session_token(&state.api, &q.token) {
        Ok(verified) => ws
            .on_upgrade(move |socket| ws_connection(state, socket, verified))
            .into_response(),
        Err(err) => reject(err).into_response(),
    }
}

async fn snapshot_event(state: &AppState) -> ServerEvent {
    match feed_snapshot(&state.api).await {
        Ok(snapshot) => ServerEvent::FeedSnapshot { snapshot },
        Err(err) => ServerEvent::Error(err),
    }
}

/// Streams snapshots until the client leaves or its token lapses.
async fn ws_connection(state: Arc<AppState>, socket: WebSocket, verified: VerifiedToken) {
    let (mut sender, mut receiver) = socket.split();
    // Subscribe before the first read so no append between the two is missed.
    let mut feed_rx = state.feed_changed.subscribe();
    let user_id = verified.identity.user_id.0;
    info!(user_id, "feed: subscriber attached");

    let expiry = tokio::time::sleep(verified.time_left());
    let send_state = Arc::clone(&state);
    let mut send_task = tokio::spawn(async move {
        tokio::pin!(expiry);
        loop {
            let event = snapshot_event(&send_state).await;
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(err) => {
                    warn!(%err, "feed: failed to encode snapshot event");
                    break;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }

            tokio::select! {
                changed = feed_rx.recv() => match changed {
                    Ok(FeedChanged) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "feed: subscriber lagged; sending fresh snapshot");
                    }
                    Err(RecvError::Closed) => break,
                },
                () = &mut expiry => {
                    info!(user_id, "feed: token expired; closing subscriber");
                    let expired = ServerEvent::Error(ApiError::new(
                        ErrorCode::Unauthorized,
                        "token expired",
                    ));
                    if let Ok(text) = serde_json::to_string(&expired) {
                        let _ = sender.send(Message::Text(text)).await;
                    }
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let read_loop = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    };
    tokio::select! {
        _ = &mut send_task => {}
        () = read_loop => send_task.abort(),
    }
    info!(user_id, "feed: subscriber detached");
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
