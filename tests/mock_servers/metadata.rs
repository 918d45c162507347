//! Mock station metadata endpoint
//!
//! Serves `GET /<anything>.json` with a configurable status, body and delay,
//! and records what it saw.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

struct MockMetadataState {
    status: StatusCode,
    body: String,
    delay: Duration,
    requests: usize,
    last_user_agent: Option<String>,
}

pub struct MockMetadataServer {
    addr: SocketAddr,
    state: Arc<RwLock<MockMetadataState>>,
    handle: JoinHandle<()>,
}

impl MockMetadataServer {
    /// Start on a random port, answering with an empty now-playing list
    pub async fn start() -> Self {
        let state = Arc::new(RwLock::new(MockMetadataState {
            status: StatusCode::OK,
            body: json!({ "nowplaying": [] }).to_string(),
            delay: Duration::ZERO,
            requests: 0,
            last_user_agent: None,
        }));

        let app = Router::new()
            .route("/{file}", get(handle_metadata))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    /// Base URL for metadata sources served by this mock
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url(&self, file: &str) -> String {
        format!("{}/{}", self.base_url(), file)
    }

    pub async fn set_now_playing(&self, entries: &[(&str, &str)]) {
        let list: Vec<_> = entries
            .iter()
            .enumerate()
            .map(|(i, (artist, title))| {
                json!({ "timestamp": format!("2024-05-01T10:0{}:00", i), "artist": artist, "title": title })
            })
            .collect();
        let mut state = self.state.write().await;
        state.status = StatusCode::OK;
        state.body = json!({ "nowplaying": list }).to_string();
    }

    pub async fn set_response(&self, status: StatusCode, body: &str) {
        let mut state = self.state.write().await;
        state.status = status;
        state.body = body.to_string();
    }

    pub async fn set_delay(&self, delay: Duration) {
        self.state.write().await.delay = delay;
    }

    pub async fn request_count(&self) -> usize {
        self.state.read().await.requests
    }

    pub async fn last_user_agent(&self) -> Option<String> {
        self.state.read().await.last_user_agent.clone()
    }
}

impl Drop for MockMetadataServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_metadata(
    State(state): State<Arc<RwLock<MockMetadataState>>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let (status, body, delay) = {
        let mut state = state.write().await;
        state.requests += 1;
        state.last_user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        (state.status, state.body.clone(), state.delay)
    };

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    (status, [(header::CONTENT_TYPE, "application/json")], body)
}
