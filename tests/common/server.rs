//! Media server for integration tests
//!
//! Serves registered routes on a random port and counts GET hits per path.
//! Routes can answer any status, stream a body without `Content-Length`, or
//! hold the response back for a while.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::Response;
use axum::Router;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// Response registered for one path.
#[derive(Debug, Clone)]
pub struct Route {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    /// Stream the body in chunks with no `Content-Length`.
    pub chunked: bool,
    /// Size announced to HEAD probes instead of the real one.
    pub declared_len: Option<u64>,
    pub delay: Duration,
}

impl Route {
    pub fn ok(body: Vec<u8>, content_type: &str) -> Self {
        Self {
            status: 200,
            body,
            content_type: Some(content_type.to_string()),
            chunked: false,
            declared_len: None,
            delay: Duration::ZERO,
        }
    }

    pub fn png(body: Vec<u8>) -> Self {
        Self::ok(body, "image/png")
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            content_type: None,
            chunked: false,
            declared_len: None,
            delay: Duration::ZERO,
        }
    }

    pub fn chunked(mut self) -> Self {
        self.chunked = true;
        self
    }

    pub fn declaring(mut self, len: u64) -> Self {
        self.declared_len = Some(len);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Default)]
struct ServerState {
    routes: Mutex<HashMap<String, Route>>,
    hits: Mutex<HashMap<String, usize>>,
}

async fn serve(State(state): State<Arc<ServerState>>, method: Method, uri: Uri) -> Response {
    let path = uri.path().to_string();
    let route = state
        .routes
        .lock()
        .unwrap()
        .get(&path)
        .cloned()
        .unwrap_or_else(|| Route::status(404));

    if method == Method::GET {
        *state.hits.lock().unwrap().entry(path).or_insert(0) += 1;
        if !route.delay.is_zero() {
            tokio::time::sleep(route.delay).await;
        }
    }

    // Streamed routes refuse probes so their size stays unknown
    let status = if method == Method::HEAD && route.chunked {
        405
    } else {
        route.status
    };
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    if let Some(content_type) = &route.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }

    let body = if method == Method::HEAD {
        if status == 200 {
            let len = route.declared_len.unwrap_or(route.body.len() as u64);
            builder = builder.header(header::CONTENT_LENGTH, len);
        }
        Body::empty()
    } else if route.chunked {
        let chunks: Vec<Result<Bytes, std::io::Error>> = route
            .body
            .chunks(16 * 1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Body::from_stream(futures::stream::iter(chunks))
    } else {
        Body::from(route.body)
    };

    builder.body(body).unwrap()
}

/// Media server instance. Shuts down when dropped.
pub struct MediaServer {
    /// Base URL for building media URLs (e.g., "http://127.0.0.1:12345")
    pub base_url: String,
    state: Arc<ServerState>,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MediaServer {
    /// Spawns a new media server on a random port
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let state = Arc::new(ServerState::default());
        let app = Router::new().fallback(serve).with_state(state.clone());

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        Self {
            base_url: format!("http://127.0.0.1:{}", port),
            state,
            _shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Registers `route` at `path` and returns the full URL.
    pub fn route(&self, path: &str, route: Route) -> String {
        self.state
            .routes
            .lock()
            .unwrap()
            .insert(path.to_string(), route);
        self.url(path)
    }

    /// Number of GET requests seen for `path`.
    pub fn hits(&self, path: &str) -> usize {
        self.state.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}
