// Module: http
// HTTP ingress for submissions and listener connections

pub mod error;
pub mod health;
pub mod submit;
pub mod websocket;

use axum::{
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use relaycast_cluster::{
    FanoutRegistry, InboundStats, LifecycleState, RelayHandles, SubmissionIngestor,
};
use relaycast_core::config::ServerConfig;

use crate::observability::metrics_layer;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub ingestor: SubmissionIngestor,
    pub fanout: FanoutRegistry,
    pub lifecycle: watch::Receiver<LifecycleState>,
    pub inbound: Arc<InboundStats>,
}

impl AppState {
    #[must_use]
    pub fn new(handles: &RelayHandles) -> Self {
        Self {
            ingestor: handles.ingestor.clone(),
            fanout: handles.fanout.clone(),
            lifecycle: handles.state.clone(),
            inbound: Arc::clone(&handles.inbound),
        }
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    let router = Router::new()
        .route("/submit", post(submit::submit))
        // WebSocket endpoint for broadcast listeners
        .route("/ws", get(websocket::websocket_handler))
        .merge(health::create_health_router())
        .route_layer(middleware::from_fn(metrics_layer));

    // Apply layers before state
    let router = router
        .layer(cors_layer(&server.cors_allowed_origins))
        .layer(TraceLayer::new_for_http());

    // Apply state to all routes (must be last)
    router.with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION]);

    if allowed_origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    layer.allow_origin(AllowOrigin::list(origins))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use relaycast_cluster::{Coordinator, MemoryBroker, RelaySettings};
    use relaycast_cluster::ChannelConnection;
    use relaycast_core::{ChannelMap, MemoryStore, Origin};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        state: AppState,
        coordinator: Coordinator,
        store: MemoryStore,
    }

    fn test_app() -> TestApp {
        let store = MemoryStore::new();
        let mut coordinator = Coordinator::new(
            Arc::new(MemoryBroker::new()),
            Arc::new(store.clone()),
            ChannelMap::default(),
            RelaySettings::default(),
        );
        let handles = coordinator.start().unwrap();
        let ingress = handles.ingress_shutdown.clone();
        coordinator.attach_ingress(tokio::spawn(async move {
            ingress.cancelled().await;
            Ok(())
        }));

        let state = AppState::new(&handles);
        let router = create_router(state.clone(), &ServerConfig::default());
        TestApp {
            router,
            state,
            coordinator,
            store,
        }
    }

    fn form(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/submit")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_submit_form_accepted() {
        let mut app = test_app();

        let response = app.router.clone().oneshot(form("content=hello")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Input notification \n hello\n");
        assert_eq!(app.store.count_by_origin(Origin::Submission), 1);
        app.coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_json_accepted() {
        let mut app = test_app();

        let request = Request::builder()
            .method("POST")
            .uri("/submit")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"content":"from json"}"#))
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("from json"));
        app.coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_empty_rejected() {
        let mut app = test_app();

        for body in ["content=", "content=%20%20", ""] {
            let response = app.router.clone().oneshot(form(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);

            let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
            assert_eq!(json["error"], "Content is required");
            assert_eq!(json["status"], 400);
        }

        assert!(app.store.records().is_empty());
        app.coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_store_failure_is_internal_error() {
        let mut app = test_app();
        app.store.set_failing(true);

        let response = app.router.clone().oneshot(form("content=hello")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["error"], "Failed to insert content");
        app.coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_wrong_method() {
        let mut app = test_app();

        let request = Request::builder().uri("/submit").body(Body::empty()).unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        app.coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let mut app = test_app();

        let request = Request::builder()
            .method("OPTIONS")
            .uri("/submit")
            .header("origin", "http://localhost:3000")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type")
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "http://localhost:3000"
        );
        app.coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_follows_lifecycle() {
        let mut app = test_app();

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "OK");

        app.coordinator.shutdown().await.unwrap();

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(response).await, "stopped");
    }

    #[tokio::test]
    async fn test_metrics_exposed() {
        let mut app = test_app();
        app.router.clone().oneshot(form("content=counted")).await.unwrap();

        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains("relay_submissions_total"));
        assert!(text.contains("http_requests_total"));
        app.coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let mut app = test_app();

        let request = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();

        assert!(response.status().is_client_error());
        assert_eq!(app.coordinator.state(), LifecycleState::Running);
        app.coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_lists_listeners() {
        let mut app = test_app();
        let (conn, _rx, _closed) = ChannelConnection::pair();
        let connection_id = app.state.fanout.attach(conn).await.unwrap();

        let request = Request::builder().uri("/status").body(Body::empty()).unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["listeners"][0]["connection_id"], connection_id);
        assert_eq!(json["listeners"][0]["forwarded"], 0);
        assert_eq!(json["inbound"]["errors"], 0);
        app.coordinator.shutdown().await.unwrap();
    }
}
