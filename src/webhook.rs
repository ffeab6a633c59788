//! HTTP side: health check and user registered webhooks.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info};

pub type WebhookResult = anyhow::Result<Option<Value>>;
type Handler = Arc<dyn Fn(WebhookRequest) -> BoxFuture<'static, WebhookResult> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebhookMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: WebhookMethod,
    pub id: String,
    pub query: HashMap<String, String>,
    /// Parsed JSON body; `Null` for GET and empty bodies.
    pub body: Value,
}

/// Registry of `/webhook/{id}` handlers, shared with the running server.
#[derive(Clone, Default)]
pub struct Webhooks {
    routes: Arc<RwLock<HashMap<(WebhookMethod, String), Handler>>>,
}

impl Webhooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler returning `Ok(None)` answers `{"ok": true}`; `Ok(Some(v))`
    /// answers `v`; an error answers 500 `{"error": ...}`. Registering the
    /// same method and id again replaces the handler.
    pub fn register<F, Fut>(&self, method: WebhookMethod, id: &str, handler: F)
    where
        F: Fn(WebhookRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WebhookResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |request: WebhookRequest| handler(request).boxed());
        match self.routes.write() {
            Ok(mut routes) => {
                info!("Registered webhook {:?} /webhook/{}", method, id);
                routes.insert((method, id.to_string()), handler);
            }
            Err(err) => error!("Unable to register webhook {}: {}", id, err),
        }
    }

    pub async fn dispatch(&self, request: WebhookRequest) -> (StatusCode, Value) {
        let handler = self
            .routes
            .read()
            .ok()
            .and_then(|routes| routes.get(&(request.method, request.id.clone())).cloned());
        let Some(handler) = handler else {
            debug!("No webhook {:?} {}", request.method, request.id);
            return (StatusCode::NOT_FOUND, json!({"error": "Not found"}));
        };

        let id = request.id.clone();
        match handler(request).await {
            Ok(None) => (StatusCode::OK, json!({"ok": true})),
            Ok(Some(body)) => (StatusCode::OK, body),
            Err(err) => {
                error!("Webhook {} failed: {:#}", id, err);
                (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": err.to_string()}))
            }
        }
    }
}

#[derive(Clone)]
struct AppState {
    namespace: Arc<String>,
    webhooks: Webhooks,
    /// Mirrors whether HA is up; drives the health answer.
    running: Arc<AtomicBool>,
}

pub fn router(namespace: &str, webhooks: Webhooks, running: Arc<AtomicBool>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(status))
        .route("/webhook/:id", get(get_webhook).post(post_webhook))
        .with_state(AppState {
            namespace: Arc::new(namespace.to_string()),
            webhooks,
            running,
        })
        .layer(cors)
}

pub async fn serve(port: u16, router: Router) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Listening on port {}", port);
    axum::serve(listener, router).await
}

/// GET /
async fn status(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    if state.running.load(Ordering::SeqCst) {
        let message = format!("{} is running", state.namespace);
        (StatusCode::OK, Json(json!({ "message": message })))
    } else {
        let message = format!("{} is not running", state.namespace);
        (StatusCode::FORBIDDEN, Json(json!({ "message": message })))
    }
}

async fn get_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    let request = WebhookRequest {
        method: WebhookMethod::Get,
        id,
        query,
        body: Value::Null,
    };
    let (status, body) = state.webhooks.dispatch(request).await;
    (status, Json(body))
}

async fn post_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let body = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(body) => body,
            Err(err) => return (StatusCode::BAD_REQUEST, Json(json!({"error": err.to_string()}))),
        }
    };
    let request = WebhookRequest {
        method: WebhookMethod::Post,
        id,
        query,
        body,
    };
    let (status, body) = state.webhooks.dispatch(request).await;
    (status, Json(body))
}
