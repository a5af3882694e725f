// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Immutable description of one API request.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use tokio_util::sync::CancellationToken;

/// Everything needed to issue (and reissue) a request.
///
/// The body is held as [`Bytes`] so the single retry after a token refresh
/// can resend it without copying.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    /// Path relative to the API base URL, e.g. `/api/explain`.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub cancel: CancellationToken,
    /// Attach the stored access token. Anonymous requests still carry the
    /// correlation identifier.
    pub include_credentials: bool,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            cancel: CancellationToken::new(),
            include_credentials: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Set a JSON body and content type.
    pub fn json(self, value: &serde_json::Value) -> Self {
        self.header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(value.to_string())
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn cancel_with(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.include_credentials = false;
        self
    }

    /// Derive a copy whose only difference is the authorization header.
    pub fn with_bearer(&self, access_token: &str) -> Self {
        let mut next = self.clone();
        match HeaderValue::from_str(&format!("Bearer {access_token}")) {
            Ok(mut value) => {
                value.set_sensitive(true);
                next.headers.insert(AUTHORIZATION, value);
            }
            Err(_) => {
                tracing::warn!("access token is not a valid header value, sending without it");
                next.headers.remove(AUTHORIZATION);
            }
        }
        next
    }

    pub fn bearer(&self) -> Option<&str> {
        self.headers.get(AUTHORIZATION)?.to_str().ok()?.strip_prefix("Bearer ")
    }
}

#[cfg(test)]
#[path = "request_tests.rs"]
mod tests;
