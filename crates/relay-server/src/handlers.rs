//! HTTP and WebSocket handlers for the relay.
//!
//! Routes:
//! - `GET {base_path}/service-info` - discovery descriptor
//! - `GET {base_path}{socket_io_path}` - WebSocket push channel
//!
//! Everything else answers `404` with an empty body.

use crate::config::Config;
use crate::metrics::SessionMetricsGuard;
use crate::service_info::ServiceInfo;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use chord_relay_core::{ChannelSession, ConnectionRegistry, SessionId};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Shared server state.
pub struct AppState {
    /// Live sessions.
    pub registry: Arc<ConnectionRegistry>,
    /// Discovery descriptor.
    pub service_info: ServiceInfo,
    /// Maximum number of concurrent sessions.
    pub max_connections: usize,
    /// One permit per session slot, taken before the upgrade.
    slots: Arc<Semaphore>,
    /// Outbound queue size per session.
    pub session_buffer: usize,
    /// Maximum inbound message size.
    pub max_message_size: usize,
    /// Interval between server pings.
    pub heartbeat: Duration,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: &Config, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            service_info: ServiceInfo::from(&config.service),
            max_connections: config.limits.max_connections,
            slots: Arc::new(Semaphore::new(
                config.limits.max_connections.min(Semaphore::MAX_PERMITS),
            )),
            session_buffer: config.limits.session_buffer,
            max_message_size: config.limits.max_message_size,
            heartbeat: Duration::from_millis(config.heartbeat.interval_ms),
        }
    }

    /// Reserve a session slot, or `None` if every slot is taken.
    ///
    /// The slot is released when the permit is dropped.
    fn reserve_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }
}

/// Build the HTTP router.
pub fn router(config: &Config, state: Arc<AppState>) -> Router {
    let socket_path = config.socket_path();

    Router::new()
        .route(
            &config.service_info_path(),
            get(service_info_handler).fallback(not_found),
        )
        .route(&socket_path, get(ws_handler).fallback(not_found))
        .route(&format!("{socket_path}/"), get(ws_handler).fallback(not_found))
        .fallback(not_found)
        .with_state(state)
}

/// Discovery handler.
async fn service_info_handler(State(state): State<Arc<AppState>>) -> Json<ServiceInfo> {
    Json(state.service_info.clone())
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let Some(slot) = state.reserve_slot() else {
        warn!(
            max_connections = state.max_connections,
            "Refusing session: connection limit reached"
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, slot))
}

/// Handle a WebSocket session.
///
/// Frames queued by the broadcaster are written in order. The session ends
/// when the client goes away or when the relay drops the session from the
/// registry, in which case queued frames are flushed before closing.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, _slot: OwnedSemaphorePermit) {
    let _metrics_guard = SessionMetricsGuard::new();

    let session_id = SessionId::generate();
    let (session, mut outbound) = ChannelSession::new(session_id.clone(), state.session_buffer);
    let lease = state.registry.register(Arc::new(session));

    debug!(session = %session_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let mut heartbeat = interval_at(Instant::now() + state.heartbeat, state.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = sender.send(Message::Text(frame.as_str().into())).await {
                            debug!(session = %session_id, error = %e, "Send failed");
                            break;
                        }
                    }
                    None => {
                        debug!(session = %session_id, "Session closed by relay");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(session = %session_id, "Received close frame");
                        break;
                    }
                    Some(Ok(_)) => {
                        trace!(session = %session_id, "Ignoring client message");
                    }
                    Some(Err(e)) => {
                        warn!(session = %session_id, error = %e, "WebSocket error");
                        break;
                    }
                    None => {
                        debug!(session = %session_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    debug!(session = %lease.id(), "WebSocket disconnected");
    drop(lease);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    fn app(config: &Config) -> Router {
        let state = Arc::new(AppState::new(config, Arc::new(ConnectionRegistry::new())));
        router(config, state)
    }

    async fn call(app: Router, method: Method, uri: &str) -> (StatusCode, Bytes) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body)
    }

    #[tokio::test]
    async fn test_service_info() {
        let mut config = Config::default();
        config.service.version = "9.9.9".to_string();

        let (status, body) = call(app(&config), Method::GET, "/service-info").await;
        assert_eq!(status, StatusCode::OK);

        let info: ServiceInfo = serde_json::from_slice(&body).unwrap();
        assert_eq!(info.version, "9.9.9");
        assert_eq!(info.id, "ca.c3g.chord:event-relay");
        assert_eq!(info.kind, "ca.c3g.chord:event-relay:9.9.9");
    }

    #[tokio::test]
    async fn test_service_info_is_stable() {
        let config = Config::default();
        let app = app(&config);
        let (_, first) = call(app.clone(), Method::GET, "/service-info").await;
        let (_, second) = call(app, Method::GET, "/service-info").await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_service_info_content_type() {
        let config = Config::default();
        let request = Request::builder()
            .uri("/service-info")
            .body(Body::empty())
            .unwrap();
        let response = app(&config).oneshot(request).await.unwrap();
        assert_eq!(
            response.headers()["content-type"],
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_base_path() {
        let mut config = Config::default();
        config.base_path = "/api/event-relay".to_string();
        config.validate().unwrap();

        let (status, _) = call(app(&config), Method::GET, "/api/event-relay/service-info").await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(app(&config), Method::GET, "/service-info").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_path_is_empty_404() {
        let config = Config::default();
        let (status, body) = call(app(&config), Method::GET, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_method_is_404() {
        let config = Config::default();
        let (status, body) = call(app(&config), Method::POST, "/service-info").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.is_empty());

        let (status, _) = call(app(&config), Method::DELETE, "/socket.io").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_session_slots() {
        let mut config = Config::default();
        config.limits.max_connections = 2;
        let state = AppState::new(&config, Arc::new(ConnectionRegistry::new()));

        let first = state.reserve_slot().unwrap();
        let _second = state.reserve_slot().unwrap();
        assert!(state.reserve_slot().is_none());

        drop(first);
        assert!(state.reserve_slot().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_reservations_respect_limit() {
        let mut config = Config::default();
        config.limits.max_connections = 3;
        let state = Arc::new(AppState::new(&config, Arc::new(ConnectionRegistry::new())));

        let attempts: Vec<_> = (0..32)
            .map(|_| {
                let state = Arc::clone(&state);
                tokio::spawn(async move { state.reserve_slot() })
            })
            .collect();

        let mut held = Vec::new();
        for attempt in attempts {
            if let Some(permit) = attempt.await.unwrap() {
                held.push(permit);
            }
        }
        assert_eq!(held.len(), 3);
    }

    #[tokio::test]
    async fn test_socket_path_requires_upgrade() {
        let config = Config::default();
        let (status, _) = call(app(&config), Method::GET, "/socket.io").await;
        assert!(status.is_client_error());
        assert_ne!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_engine_io_polling_is_not_served() {
        let config = Config::default();
        let (status, body) = call(
            app(&config),
            Method::GET,
            "/socket.io/?EIO=4&transport=polling",
        )
        .await;
        assert!(status.is_client_error());
        assert!(!body.starts_with(b"0{"));
    }
}
