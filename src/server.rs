//! HTTP surface: the client websocket channel plus stats and payment routes.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt, future};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::EngineError;
use crate::gateway::{GatewayError, NewPayment, PaymentGateway};
use crate::notify::{ClientSink, ClientStream, NotifyError};
use crate::store::StoreError;

pub const DEFAULT_MESSAGES_LIMIT: usize = 50;
pub const MAX_MESSAGES_LIMIT: usize = 1000;

const CANCEL_REASON: &str = "cancelled by merchant";

pub fn router(gateway: Arc<PaymentGateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/stats/websocket", get(connection_stats))
        .route("/api/v1/stats/websocket/messages", get(recent_messages))
        .route("/api/v1/payments", post(create_payment))
        .route(
            "/api/v1/payments/:payment_id",
            get(get_payment).delete(cancel_payment),
        )
        .route("/ws/payments/:payment_id", get(payment_socket))
        .with_state(gateway)
}

/// Serve until `shutdown` fires, then drain in-flight requests.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<PaymentGateway>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// JSON error body with a stable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": { "code": self.code, "message": self.message } });
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let (status, code) = match e {
            StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "payment_not_found"),
            StoreError::Duplicate(_) => (StatusCode::CONFLICT, "duplicate_payment"),
            StoreError::AlreadyFinal(..) => (StatusCode::CONFLICT, "payment_final"),
        };
        ApiError {
            status,
            code,
            message: e.to_string(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let (status, code) = match e {
            EngineError::UnsupportedToken(_) => (StatusCode::BAD_REQUEST, "unsupported_token"),
            EngineError::DuplicateRegistration(_) => (StatusCode::CONFLICT, "duplicate_payment"),
            EngineError::NotRegistered(_) => (StatusCode::NOT_FOUND, "payment_not_pending"),
        };
        ApiError {
            status,
            code,
            message: e.to_string(),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        let code = match e {
            GatewayError::Engine(e) => return e.into(),
            GatewayError::Store(e) => return e.into(),
            GatewayError::Amount(_) => "invalid_amount",
            GatewayError::Receiver(_) => "invalid_receiver",
            GatewayError::NoReceiver => "missing_receiver",
        };
        ApiError {
            status: StatusCode::BAD_REQUEST,
            code,
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct MessagesQuery {
    limit: Option<String>,
}

/// Requested page size; anything unparsable or out of range falls back to the default.
fn messages_limit(raw: Option<&str>) -> usize {
    raw.and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|limit| (1..=MAX_MESSAGES_LIMIT).contains(limit))
        .unwrap_or(DEFAULT_MESSAGES_LIMIT)
}

async fn health(State(gateway): State<Arc<PaymentGateway>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "upstreamConnected": gateway.is_upstream_connected(),
    }))
}

async fn connection_stats(State(gateway): State<Arc<PaymentGateway>>) -> impl IntoResponse {
    Json(gateway.connection_stats())
}

async fn recent_messages(
    State(gateway): State<Arc<PaymentGateway>>,
    Query(query): Query<MessagesQuery>,
) -> impl IntoResponse {
    let messages = gateway.recent_diagnostics(messages_limit(query.limit.as_deref()));
    Json(json!({ "count": messages.len(), "messages": messages }))
}

async fn create_payment(
    State(gateway): State<Arc<PaymentGateway>>,
    Json(request): Json<NewPayment>,
) -> Result<impl IntoResponse, ApiError> {
    let record = gateway.create_payment(request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_payment(
    State(gateway): State<Arc<PaymentGateway>>,
    Path(payment_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(gateway.payment(&payment_id).await?))
}

async fn cancel_payment(
    State(gateway): State<Arc<PaymentGateway>>,
    Path(payment_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    gateway.cancel_payment(&payment_id, CANCEL_REASON)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Upgrade to the payment's notification channel. Unknown payments are
/// rejected before the upgrade.
async fn payment_socket(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<PaymentGateway>>,
    Path(payment_id): Path<String>,
) -> Result<Response, ApiError> {
    gateway.payment(&payment_id).await?;
    debug!(payment_id = %payment_id, "upgrading client connection");
    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = client_transport(socket);
        gateway.attach_client(&payment_id, sink, stream).await;
    }))
}

/// Adapt an axum websocket to the notifier's text-frame transport.
fn client_transport(socket: WebSocket) -> (ClientSink, ClientStream) {
    let (write, read) = socket.split();
    let sink = write
        .sink_map_err(|e| NotifyError::Transport(e.to_string()))
        .with(|text: String| future::ready(Ok::<_, NotifyError>(Message::Text(text))));
    let stream = read.filter_map(|message| {
        future::ready(match message {
            Ok(Message::Text(text)) => Some(Ok(text)),
            Ok(Message::Binary(bytes)) => String::from_utf8(bytes).ok().map(Ok),
            Ok(_) => None,
            Err(e) => Some(Err(NotifyError::Transport(e.to_string()))),
        })
    });
    (Box::pin(sink), Box::pin(stream))
}
