// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process fake backend for deterministic client tests.
//!
//! Serves scripted responses for API calls and the refresh endpoint on an
//! ephemeral port, counts calls, and records the auth headers it received.
//! `/stream` serves chunks pushed by the test through a channel.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, post};
use axum::Router;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::auth::{AuthTokenRecord, ExpiringToken, UserProfile};
use crate::client::ANONYMOUS_ID_HEADER;
use crate::epoch_ms;

/// Path of the fake refresh endpoint.
pub const REFRESH_PATH: &str = "/api/auth/refresh";

/// One scripted response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
    /// Held back this long before answering.
    pub delay: Option<Duration>,
}

impl MockResponse {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self { status, body: body.to_string(), headers: vec![], delay: None }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// 401 signalling an expired access token.
    pub fn token_expired() -> Self {
        Self::json(401, serde_json::json!({"detail": {"errorCode": "TOKEN_EXPIRED"}}))
    }

    pub fn login_required(status: u16) -> Self {
        Self::json(status, serde_json::json!({"error_code": "LOGIN_REQUIRED"}))
    }

    /// A refresh endpoint success carrying `access` / `refresh`.
    pub fn refreshed(access: &str, refresh: &str) -> Self {
        let now = epoch_ms();
        Self::json(
            200,
            serde_json::json!({
                "access_token": access,
                "access_token_expires_at": now + 3_600_000,
                "refresh_token": refresh,
                "refresh_token_expires_at": now + 86_400_000,
                "session_id": "session-2",
                "user": {"id": "u1", "name": "Ada", "email": "ada@example.com", "role": "member"},
            }),
        )
    }

    async fn delayed(self) -> Self {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self
    }
}

impl IntoResponse for MockResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) =
                (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value))
            {
                headers.insert(name, value);
            }
        }
        (status, headers, self.body).into_response()
    }
}

/// Headers seen on one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeenRequest {
    pub path: String,
    pub authorization: Option<String>,
    pub anonymous_id: Option<String>,
}

/// Scripted responses are consumed in order; the last one repeats.
#[derive(Default)]
struct Script {
    responses: Mutex<VecDeque<MockResponse>>,
    last: Mutex<Option<MockResponse>>,
}

impl Script {
    fn new(responses: Vec<MockResponse>) -> Self {
        Self { responses: Mutex::new(responses.into()), last: Mutex::new(None) }
    }

    fn next(&self) -> MockResponse {
        if let Some(resp) = self.responses.lock().pop_front() {
            *self.last.lock() = Some(resp.clone());
            return resp;
        }
        self.last
            .lock()
            .clone()
            .unwrap_or_else(|| MockResponse::json(500, serde_json::json!({"detail": "unscripted"})))
    }
}

struct BackendState {
    api: Script,
    refresh: Script,
    /// Responses returned by `/stream` before it starts streaming.
    stream_rejections: Mutex<VecDeque<MockResponse>>,
    stream_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    api_calls: AtomicU32,
    refresh_calls: AtomicU32,
    seen: Mutex<Vec<SeenRequest>>,
}

/// Handle to a running fake backend.
pub struct MockBackend {
    pub addr: SocketAddr,
    state: Arc<BackendState>,
    stream_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl MockBackend {
    /// Start serving `api` for every non-refresh path and `refresh` for the
    /// refresh endpoint.
    pub async fn start(api: Vec<MockResponse>, refresh: Vec<MockResponse>) -> anyhow::Result<Self> {
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let state = Arc::new(BackendState {
            api: Script::new(api),
            refresh: Script::new(refresh),
            stream_rejections: Mutex::new(VecDeque::new()),
            stream_rx: Mutex::new(Some(stream_rx)),
            api_calls: AtomicU32::new(0),
            refresh_calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        });

        let refresh_state = Arc::clone(&state);
        let stream_state = Arc::clone(&state);
        let api_state = Arc::clone(&state);
        let app = Router::new()
            .route(
                REFRESH_PATH,
                post(move |_body: String| {
                    let state = Arc::clone(&refresh_state);
                    async move {
                        state.refresh_calls.fetch_add(1, Ordering::SeqCst);
                        state.refresh.next().delayed().await
                    }
                }),
            )
            .route(
                "/stream",
                any(move |headers: HeaderMap| {
                    let state = Arc::clone(&stream_state);
                    async move { state.serve_stream(&headers) }
                }),
            )
            .fallback(move |uri: axum::http::Uri, headers: HeaderMap| {
                let state = Arc::clone(&api_state);
                async move {
                    state.record(uri.path(), &headers);
                    state.api_calls.fetch_add(1, Ordering::SeqCst);
                    state.api.next().delayed().await
                }
            });

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Ok(Self { addr, state, stream_tx: Mutex::new(Some(stream_tx)) })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn refresh_url(&self) -> String {
        format!("http://{}{REFRESH_PATH}", self.addr)
    }

    /// Calls to any path except the refresh endpoint.
    pub fn api_calls(&self) -> u32 {
        self.state.api_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> u32 {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.state.seen.lock().clone()
    }

    /// Make the next `/stream` call answer `resp` instead of streaming.
    pub fn reject_next_stream(&self, resp: MockResponse) {
        self.state.stream_rejections.lock().push_back(resp);
    }

    /// Queue a chunk for `/stream`.
    pub fn push_chunk(&self, chunk: impl Into<Bytes>) {
        if let Some(tx) = self.stream_tx.lock().as_ref() {
            let _ = tx.send(chunk.into());
        }
    }

    /// End the `/stream` body after the queued chunks.
    pub fn end_stream(&self) {
        self.stream_tx.lock().take();
    }
}

impl BackendState {
    fn record(&self, path: &str, headers: &HeaderMap) {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_owned);
        self.seen.lock().push(SeenRequest {
            path: path.to_owned(),
            authorization: header("authorization"),
            anonymous_id: header(ANONYMOUS_ID_HEADER),
        });
    }

    fn serve_stream(&self, headers: &HeaderMap) -> Response {
        self.record("/stream", headers);
        self.api_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(rejection) = self.stream_rejections.lock().pop_front() {
            return rejection.into_response();
        }
        let Some(rx) = self.stream_rx.lock().take() else {
            return MockResponse::json(409, serde_json::json!({"detail": "stream consumed"}))
                .into_response();
        };
        let chunks = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok::<_, std::io::Error>(chunk), rx))
        });
        (
            [("content-type", "text/event-stream")],
            Body::from_stream(chunks),
        )
            .into_response()
    }
}

/// A token record valid for an hour.
pub fn sample_record(access: &str, refresh: &str) -> AuthTokenRecord {
    let now = epoch_ms();
    AuthTokenRecord {
        access: Some(ExpiringToken { token: access.to_owned(), expires_at: now + 3_600_000 }),
        refresh: Some(ExpiringToken { token: refresh.to_owned(), expires_at: now + 86_400_000 }),
        session_id: Some("session-1".to_owned()),
        user: Some(UserProfile {
            id: "u1".to_owned(),
            name: "Ada".to_owned(),
            email: "ada@example.com".to_owned(),
            role: "member".to_owned(),
        }),
    }
}

/// Assert that an expression evaluates to `Err` whose Display output
/// contains the given substring.
#[macro_export]
macro_rules! assert_err_contains {
    ($expr:expr, $substr:expr) => {{
        let result = $expr;
        let err = result.expect_err(concat!("expected Err for: ", stringify!($expr)));
        let msg = err.to_string();
        assert!(msg.contains($substr), "expected error containing {:?}, got: {msg:?}", $substr);
    }};
}
