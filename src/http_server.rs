//! HTTP front door: `/incoming`, `/health` and `/metrics`.

use crate::delivery::Dispatcher;
use crate::smtp_client::DeliveryOutcome;
use crate::telemetry::{Observer, Telemetry};
use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    secret: Arc<str>,
    dispatcher: Dispatcher,
    telemetry: Arc<Telemetry>,
}

impl AppState {
    pub fn new(secret: &str, dispatcher: Dispatcher, telemetry: Arc<Telemetry>) -> Self {
        Self {
            secret: Arc::from(secret),
            dispatcher,
            telemetry,
        }
    }
}

/// Builds the router. Bodies above `max_message_size` are refused with `413`.
pub fn router(state: AppState, max_message_size: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route(
            "/incoming",
            post(incoming).route_layer(middleware::from_fn_with_state(
                state.clone(),
                require_bearer,
            )),
        )
        .layer(DefaultBodyLimit::max(max_message_size))
        .with_state(state)
}

/// Serves `router` on `addr` until `shutdown` is cancelled.
pub async fn serve(
    addr: &str,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), crate::error::Error> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("HTTP server listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    log::info!("HTTP server stopped");
    Ok(())
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Rejects requests without the shared secret before the body is looked at.
async fn require_bearer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let authorized = bearer_token(&request)
        .is_some_and(|token| bool::from(token.as_bytes().ct_eq(state.secret.as_bytes())));

    if !authorized {
        log::warn!("Rejected /incoming request with missing or invalid credential");
        state.telemetry.auth_rejected();
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    next.run(request).await
}

async fn incoming(State(state): State<AppState>, body: Bytes) -> Response {
    log::debug!("Received {} bytes on /incoming", body.len());

    match state.dispatcher.process(&body).await {
        DeliveryOutcome::Delivered(recipients) => (
            StatusCode::OK,
            format!("Email accepted for {}", recipients.join(", ")),
        )
            .into_response(),
        DeliveryOutcome::Failed { kind, reason } => {
            log::info!("Rejecting /incoming message: {reason}");
            (
                StatusCode::BAD_REQUEST,
                format!("{kind} failure: message not delivered"),
            )
                .into_response()
        }
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let ledger = state.telemetry.ledger();
    if ledger.is_healthy() {
        (StatusCode::OK, "OK").into_response()
    } else {
        let recent = ledger.snapshot();
        log::warn!(
            "Liveness probe failing after {} consecutive errors",
            recent.len()
        );
        (StatusCode::SERVICE_UNAVAILABLE, recent.join("\n")).into_response()
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.telemetry.render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            text,
        )
            .into_response(),
        Err(e) => {
            log::error!("Failed to render metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
