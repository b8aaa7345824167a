//! HTTP endpoints: node polling, node and client registration, the client
//! NDF poll, and the administrative ban.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use mixnet_common::{NodeId, NodeStatus};

use crate::error::StateError;
use crate::ndf::SignedNdfMessage;
use crate::node_state::UpdateNotification;
use crate::poll::{self, PollError, SignedPoll};
use crate::registration::{
    self, ClientRegistrationRequest, NodeRegistrationRequest, RegistrationError,
};
use crate::ServerContext;

pub fn build_router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/poll", post(poll_handler))
        .route("/ndf", post(client_ndf_handler))
        .route("/register/node", post(register_node_handler))
        .route("/register/client", post(register_client_handler))
        .route("/nodes/ban", post(ban_node_handler))
        .with_state(ctx)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn poll_handler(
    State(ctx): State<Arc<ServerContext>>,
    Json(msg): Json<SignedPoll>,
) -> Response {
    match poll::poll(msg, &ctx).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Client-facing NDF poll: returns the signed partial NDF when the
/// caller's hash is stale, nothing when it is current.
#[derive(Debug, Deserialize)]
struct ClientNdfRequest {
    #[serde(default, with = "hex")]
    partial_ndf_hash: Vec<u8>,
}

#[derive(Debug, Serialize)]
struct ClientNdfResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    partial_ndf: Option<SignedNdfMessage>,
}

async fn client_ndf_handler(
    State(ctx): State<Arc<ServerContext>>,
    Json(req): Json<ClientNdfRequest>,
) -> Response {
    if !ctx.state.is_ndf_ready() {
        return PollError::NdfNotReady.into_response();
    }
    let partial = ctx.state.get_partial_ndf();
    let response = if partial.compare_hash(&req.partial_ndf_hash) {
        ClientNdfResponse { partial_ndf: None }
    } else {
        ClientNdfResponse { partial_ndf: Some(partial.message()) }
    };
    Json(response).into_response()
}

async fn register_node_handler(
    State(ctx): State<Arc<ServerContext>>,
    Json(req): Json<NodeRegistrationRequest>,
) -> Response {
    match registration::register_node(&req, &ctx) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn register_client_handler(
    State(ctx): State<Arc<ServerContext>>,
    Json(req): Json<ClientRegistrationRequest>,
) -> Response {
    match registration::register_client(&req, &ctx) {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct BanRequest {
    node_id: NodeId,
}

/// Mark a node banned and hand the status change to the scheduler, which
/// kills the node's round or drops it from the pool.
async fn ban_node_handler(
    State(ctx): State<Arc<ServerContext>>,
    Json(req): Json<BanRequest>,
) -> Response {
    let Some(node) = ctx.state.node_map().get_node(req.node_id) else {
        return (StatusCode::NOT_FOUND, format!("node {} is not registered", req.node_id))
            .into_response();
    };

    // Same lock discipline as the poll path: the guard travels inside the
    // notification and the scheduler releases it.
    let guard = node.polling_lock().lock_owned().await;
    let from_status = node.status();
    node.set_status(NodeStatus::Banned);

    let mut notification = UpdateNotification::new(
        req.node_id,
        node.activity(),
        node.activity(),
        from_status,
        NodeStatus::Banned,
    );
    notification.polling_guard = Some(guard);

    match ctx.state.send_update_notification(notification) {
        Ok(()) => {
            info!(node = %req.node_id, "node banned");
            StatusCode::OK.into_response()
        }
        Err(err @ StateError::BufferFull) => {
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

impl IntoResponse for PollError {
    fn into_response(self) -> Response {
        let status = match &self {
            PollError::NdfNotReady => StatusCode::SERVICE_UNAVAILABLE,
            PollError::Auth(_) | PollError::Banned(_) => StatusCode::UNAUTHORIZED,
            PollError::UnknownNode(_) => StatusCode::NOT_FOUND,
            PollError::Version(_) | PollError::MalformedError(_) => StatusCode::BAD_REQUEST,
            PollError::State(StateError::BufferFull) => StatusCode::SERVICE_UNAVAILABLE,
            PollError::State(_) => StatusCode::CONFLICT,
        };
        (status, self.to_string()).into_response()
    }
}

impl IntoResponse for RegistrationError {
    fn into_response(self) -> Response {
        let status = match &self {
            RegistrationError::InvalidCode(_) | RegistrationError::AlreadyRegistered(_) => {
                StatusCode::FORBIDDEN
            }
            RegistrationError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            RegistrationError::Codes(_) => StatusCode::BAD_REQUEST,
            RegistrationError::Signing(_)
            | RegistrationError::Storage(_)
            | RegistrationError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
