//! HTTP endpoints for the collaboration protocol.
//!
//! The status codes carry protocol meaning: `400` is a malformed request or
//! an invalid version (the client has to resync), `409` means the client is
//! behind and must poll first, `410` means the history it asked for is gone.

use crate::error::{InstanceError, ServerError};
use crate::protocol::{EventsResponse, SubmitEvents};
use crate::registry::{PollResult, Registry};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Errors reported to HTTP clients.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not a non-negative integer: {0}")]
    NotAnInteger(String),

    #[error("Invalid request body: {0}")]
    BadBody(String),

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error("Version not current")]
    Conflict,

    #[error("History no longer available")]
    Gone,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotAnInteger(_) | ApiError::BadBody(_) | ApiError::Instance(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Conflict => StatusCode::CONFLICT,
            ApiError::Gone => StatusCode::GONE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        debug!(status = %self.status(), error = %self, "request rejected");
        (self.status(), self.to_string()).into_response()
    }
}

/// Identifies a user for presence counting: the forwarded-for header when
/// behind a proxy, else the peer address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientKey(pub String);

impl<S> FromRequestParts<S> for ClientKey
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(forwarded) = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
        {
            return Ok(ClientKey(forwarded.to_string()));
        }
        let key = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(ClientKey(key))
    }
}

fn non_neg_integer(query: &HashMap<String, String>, name: &str) -> Result<u64, ApiError> {
    let raw = query.get(name).map(String::as_str).unwrap_or("undefined");
    raw.parse()
        .map_err(|_| ApiError::NotAnInteger(raw.to_string()))
}

/// Build the router for a registry.
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/docs", get(list_docs))
        .route("/docs/{id}", get(get_doc))
        .route("/docs/{id}/events", get(poll_events).post(submit_events))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

async fn list_docs(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    Json(registry.instance_info())
}

async fn get_doc(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
    ClientKey(ip): ClientKey,
) -> impl IntoResponse {
    Json(registry.snapshot(&id, &ip))
}

async fn poll_events(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    ClientKey(ip): ClientKey,
) -> Result<Response, ApiError> {
    let version = non_neg_integer(&query, "version")?;
    let comment_version = non_neg_integer(&query, "commentVersion")?;

    match registry
        .poll_events(&id, &ip, version, comment_version)
        .await?
    {
        PollResult::Events(events) => Ok(Json(EventsResponse::from(events)).into_response()),
        PollResult::KeepAlive => Ok(Json(json!({})).into_response()),
        PollResult::Gone => Err(ApiError::Gone),
    }
}

async fn submit_events(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
    ClientKey(ip): ClientKey,
    body: Bytes,
) -> Result<Response, ApiError> {
    let submit: SubmitEvents =
        serde_json::from_slice(&body).map_err(|err| ApiError::BadBody(err.to_string()))?;
    match registry.add_events(&id, &ip, submit)? {
        Some(versions) => Ok(Json(versions).into_response()),
        None => Err(ApiError::Conflict),
    }
}

/// Serve the registry until `shutdown` resolves, then save.
///
/// Pending long polls are released with a keepalive when shutdown starts.
pub async fn serve<F>(registry: Arc<Registry>, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listen = registry.config().listen_addr();
    let addr: SocketAddr = listen
        .parse()
        .map_err(|_| ServerError::Address(listen.clone()))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!("Starting collaboration server on {}", addr);

    let app = router(registry.clone());
    let stopping = registry.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        info!("Shutting down, releasing pending polls");
        stopping.stop_all();
    })
    .await
    .map_err(|source| ServerError::Serve { source })?;

    registry.flush().await?;
    info!("Saved instances");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::protocol::{DocSnapshot, InstanceInfo, Versions};
    use crate::storage::MemoryStorage;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    fn app(config: ServerConfig) -> (Router, Arc<Registry>) {
        let registry = Arc::new(Registry::new(config, Arc::new(MemoryStorage::new())));
        (router(registry.clone()), registry)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_doc_snapshot() {
        let (app, _) = app(ServerConfig::default());
        let (status, body) = send(&app, get("/docs/demo")).await;
        assert_eq!(status, StatusCode::OK);

        let snapshot: DocSnapshot = serde_json::from_str(&body).unwrap();
        assert_eq!(snapshot.version, 0);
        assert_eq!(snapshot.users, 1);
        assert!(body.contains("\"commentVersion\":0"));
    }

    #[tokio::test]
    async fn test_list_docs() {
        let (app, registry) = app(ServerConfig::default());
        registry.get_instance("one", "a");
        let (status, body) = send(&app, get("/docs")).await;
        assert_eq!(status, StatusCode::OK);
        let info: Vec<InstanceInfo> = serde_json::from_str(&body).unwrap();
        assert_eq!(info, vec![InstanceInfo { id: "one".into(), users: 1 }]);
    }

    #[tokio::test]
    async fn test_submit_and_conflict() {
        let (app, _) = app(ServerConfig::default());
        let body = r#"{"version":0,"steps":[{"from":0,"to":0,"text":"hi"}],"clientID":1}"#;

        let (status, response) = send(&app, post("/docs/demo/events", body)).await;
        assert_eq!(status, StatusCode::OK);
        let versions: Versions = serde_json::from_str(&response).unwrap();
        assert_eq!(versions.version, 1);

        let (status, response) = send(&app, post("/docs/demo/events", body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(response, "Version not current");
    }

    #[tokio::test]
    async fn test_invalid_version_is_bad_request() {
        let (app, _) = app(ServerConfig::default());
        let body = r#"{"version":7,"steps":[],"clientID":1}"#;
        let (status, response) = send(&app, post("/docs/demo/events", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response, "Invalid version 7");

        let (status, _) = send(&app, get("/docs/demo/events?version=3&commentVersion=0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_comment_is_bad_request() {
        let (app, _) = app(ServerConfig::default());
        let body = r#"{"version":0,"clientID":1,
            "comment":[{"type":"create","id":1,"from":4,"to":4,"text":"x"}]}"#;
        let (status, response) = send(&app, post("/docs/demo/events", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response, "Invalid comment range 4..4");

        let (_, body) = send(&app, get("/docs/demo")).await;
        let snapshot: DocSnapshot = serde_json::from_str(&body).unwrap();
        assert_eq!(snapshot.comment_version, 0);
    }

    #[tokio::test]
    async fn test_malformed_requests() {
        let (app, _) = app(ServerConfig::default());
        let (status, response) =
            send(&app, get("/docs/demo/events?version=-1&commentVersion=0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response, "Not a non-negative integer: -1");

        let (status, _) = send(&app, get("/docs/demo/events?version=0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, post("/docs/demo/events", "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_history_gone() {
        let (app, registry) = app(ServerConfig::builder().max_step_history(1).build());
        for v in 0..3 {
            let body = format!(r#"{{"version":{v},"steps":[{{"from":0,"to":0,"text":"a"}}],"clientID":1}}"#);
            let (status, _) = send(&app, post("/docs/demo/events", &body)).await;
            assert_eq!(status, StatusCode::OK);
        }
        assert_eq!(registry.snapshot("demo", "x").version, 3);

        let (status, response) =
            send(&app, get("/docs/demo/events?version=0&commentVersion=0")).await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(response, "History no longer available");

        let (status, response) =
            send(&app, get("/docs/demo/events?version=2&commentVersion=0")).await;
        assert_eq!(status, StatusCode::OK);
        let events: EventsResponse = serde_json::from_str(&response).unwrap();
        assert_eq!(events.steps.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_keepalive() {
        let (app, _) = app(ServerConfig::builder().poll_timeout(1_000).build());
        let (status, body) =
            send(&app, get("/docs/demo/events?version=0&commentVersion=0")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "{}");
    }

    #[tokio::test]
    async fn test_forwarded_for_identifies_user() {
        let (app, registry) = app(ServerConfig::default());
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.1"] {
            let request = Request::builder()
                .uri("/docs/demo")
                .header("x-forwarded-for", ip)
                .body(Body::empty())
                .unwrap();
            send(&app, request).await;
        }
        assert_eq!(registry.get_instance("demo", "10.0.0.2").lock().user_count(), 2);
    }
}
