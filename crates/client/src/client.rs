// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request execution with one refresh-and-retry on expired tokens.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::auth::classify::classify_bytes;
use crate::auth::{AuthCondition, AuthEvent, RefreshCoordinator, TokenStore};
use crate::error::RequestError;
use crate::request::RequestDescriptor;
use crate::stream::{decode_stream, EventStream, StreamEvent};

/// Correlation header identifying an unauthenticated caller. Sent on every
/// request once known; the backend may hand out a new one on any response.
pub const ANONYMOUS_ID_HEADER: &str = "x-unauthenticated-user-id";

/// A fully buffered successful response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Executes [`RequestDescriptor`]s against the API.
///
/// An expired access token triggers one coordinated refresh and exactly one
/// retry. Login and subscription walls are returned as typed errors and also
/// published as [`AuthEvent`]s. Cancellation returns [`RequestError::Aborted`]
/// and publishes nothing.
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
    store: Arc<TokenStore>,
    refresher: Arc<RefreshCoordinator>,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        http: reqwest::Client,
        refresher: Arc<RefreshCoordinator>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        let store = Arc::clone(refresher.store());
        Self { base_url, http, store, refresher }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn refresher(&self) -> &Arc<RefreshCoordinator> {
        &self.refresher
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.refresher.subscribe()
    }

    /// Execute a request and buffer the response body.
    pub async fn execute(&self, req: &RequestDescriptor) -> Result<ApiResponse, RequestError> {
        let req = self.authorize(req);
        let first = self.send_buffered(&req).await?;

        match classify_bytes(first.status, &first.body) {
            AuthCondition::TokenExpired => {
                debug!(path = %req.path, "access token expired, refreshing");
                let retry = self.refreshed(&req).await?;
                let second = self.send_buffered(&retry).await?;
                let condition = classify_bytes(second.status, &second.body);
                self.settle(second, condition)
            }
            condition => self.settle(first, condition),
        }
    }

    /// Execute a streamed request.
    ///
    /// Auth conditions on the initial response are returned as `Err` before
    /// any event; error frames inside the stream arrive as
    /// [`StreamEvent::Error`]. A 2xx response that is not an event stream is
    /// buffered and classified like an error response first.
    pub async fn execute_stream(&self, req: &RequestDescriptor) -> Result<EventStream, RequestError> {
        let req = self.authorize(req);
        let first = self.send(&req).await?;
        if is_event_stream(&first) {
            return Ok(self.event_stream(first.bytes_stream(), &req));
        }

        let first = self.buffer(first, &req).await?;
        match classify_bytes(first.status, &first.body) {
            AuthCondition::TokenExpired => {
                debug!(path = %req.path, "access token expired, refreshing");
                let retry = self.refreshed(&req).await?;
                let second = self.send(&retry).await?;
                if is_event_stream(&second) {
                    return Ok(self.event_stream(second.bytes_stream(), &retry));
                }
                let second = self.buffer(second, &retry).await?;
                let condition = classify_bytes(second.status, &second.body);
                let resp = self.settle(second, condition)?;
                Ok(self.buffered_stream(resp, &retry))
            }
            condition => {
                let resp = self.settle(first, condition)?;
                Ok(self.buffered_stream(resp, &req))
            }
        }
    }

    /// Final verdict on a buffered response. A second `TokenExpired` after
    /// the retry is reported as a plain HTTP error.
    fn settle(
        &self,
        resp: ApiResponse,
        condition: AuthCondition,
    ) -> Result<ApiResponse, RequestError> {
        match condition {
            AuthCondition::LoginRequired => Err(self.login_required()),
            AuthCondition::SubscriptionRequired => {
                self.refresher.publish(AuthEvent::SubscriptionRequired);
                Err(RequestError::SubscriptionRequired)
            }
            AuthCondition::TokenExpired | AuthCondition::None => {
                if (200..300).contains(&resp.status) {
                    Ok(resp)
                } else {
                    Err(RequestError::Http { status: resp.status, body: resp.body })
                }
            }
        }
    }

    fn login_required(&self) -> RequestError {
        self.refresher.publish(AuthEvent::LoginRequired);
        RequestError::LoginRequired
    }

    /// Refresh through the coordinator and derive the retry request.
    async fn refreshed(&self, req: &RequestDescriptor) -> Result<RequestDescriptor, RequestError> {
        let result = tokio::select! {
            biased;
            _ = req.cancel.cancelled() => return Err(RequestError::Aborted),
            result = self.refresher.refresh() => result,
        };
        match result {
            Ok(record) => match record.access_token() {
                Some(token) => Ok(req.with_bearer(token)),
                None => Err(self.login_required()),
            },
            Err(e) => {
                warn!(path = %req.path, err = %e, "refresh failed, login required");
                Err(self.login_required())
            }
        }
    }

    /// Attach the current access token and the correlation identifier.
    fn authorize(&self, req: &RequestDescriptor) -> RequestDescriptor {
        let mut req = req.clone();
        if req.include_credentials {
            let record = self.store.read().unwrap_or_else(|e| {
                warn!(err = %e, "failed to read token record, using last known");
                self.store.current()
            });
            if let Some(token) = record.as_ref().and_then(|r| r.access_token()) {
                req = req.with_bearer(token);
            }
        }
        match self.store.anonymous_id() {
            Ok(Some(id)) => {
                if let Ok(value) = HeaderValue::from_str(&id) {
                    req.headers.insert(HeaderName::from_static(ANONYMOUS_ID_HEADER), value);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(err = %e, "failed to read correlation id"),
        }
        req
    }

    async fn send(&self, req: &RequestDescriptor) -> Result<reqwest::Response, RequestError> {
        let url = format!("{}{}", self.base_url, req.path);
        let mut builder = self.http.request(req.method.clone(), &url).headers(req.headers.clone());
        if let Some(ref body) = req.body {
            builder = builder.body(body.clone());
        }

        let resp = tokio::select! {
            biased;
            _ = req.cancel.cancelled() => return Err(RequestError::Aborted),
            resp = builder.send() => resp.map_err(|e| RequestError::Network(e.to_string()))?,
        };
        debug!(method = %req.method, path = %req.path, status = resp.status().as_u16(), "response");
        self.remember_anonymous_id(resp.headers());
        Ok(resp)
    }

    async fn send_buffered(&self, req: &RequestDescriptor) -> Result<ApiResponse, RequestError> {
        let resp = self.send(req).await?;
        self.buffer(resp, req).await
    }

    async fn buffer(
        &self,
        resp: reqwest::Response,
        req: &RequestDescriptor,
    ) -> Result<ApiResponse, RequestError> {
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = tokio::select! {
            biased;
            _ = req.cancel.cancelled() => return Err(RequestError::Aborted),
            body = resp.bytes() => body.map_err(|e| RequestError::Network(e.to_string()))?,
        };
        Ok(ApiResponse { status, headers, body })
    }

    /// Persist a correlation id handed out by the backend. Fire-and-forget.
    fn remember_anonymous_id(&self, headers: &HeaderMap) {
        let Some(id) = headers
            .get(ANONYMOUS_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|id| !id.is_empty())
        else {
            return;
        };
        let id = id.to_owned();
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.set_anonymous_id(&id) {
                warn!(err = %e, "failed to persist correlation id");
            }
        });
    }

    /// Decode `chunks` lazily, publishing auth conditions carried by error
    /// frames.
    fn event_stream<S, E>(&self, chunks: S, req: &RequestDescriptor) -> EventStream
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let refresher = Arc::clone(&self.refresher);
        let events = decode_stream(chunks, req.cancel.clone());
        Box::pin(events.inspect(move |item| {
            if let Ok(StreamEvent::Error { condition, .. }) = item {
                match condition {
                    AuthCondition::LoginRequired => refresher.publish(AuthEvent::LoginRequired),
                    AuthCondition::SubscriptionRequired => {
                        refresher.publish(AuthEvent::SubscriptionRequired)
                    }
                    _ => {}
                }
            }
        }))
    }

    /// Decode an already buffered 2xx body as a single chunk.
    fn buffered_stream(&self, resp: ApiResponse, req: &RequestDescriptor) -> EventStream {
        let body = futures_util::stream::once(async move { Ok::<_, Infallible>(resp.body) });
        self.event_stream(body, req)
    }
}

/// A 2xx response announced as `text/event-stream`. Anything else is
/// buffered so its body can be classified.
fn is_event_stream(resp: &reqwest::Response) -> bool {
    resp.status().is_success()
        && resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.trim_start().starts_with("text/event-stream"))
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
