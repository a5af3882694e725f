// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Map backend responses to auth conditions.
//!
//! The backend reports auth problems in the body, not reliably in the status
//! code, so the same body checks run on every response and on error events
//! inside streams.

use serde::Serialize;

pub const TOKEN_EXPIRED: &str = "TOKEN_EXPIRED";
pub const LOGIN_REQUIRED: &str = "LOGIN_REQUIRED";
pub const SUBSCRIPTION_REQUIRED: &str = "SUBSCRIPTION_REQUIRED";

/// Auth condition carried by a response or stream error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthCondition {
    /// The access token expired; refresh and retry. Only produced for 401.
    TokenExpired,
    LoginRequired,
    SubscriptionRequired,
    None,
}

/// The `detail` field in its possible shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Detail {
    Absent,
    Text(String),
    Object { code: Option<String> },
}

/// The error-bearing parts of a response body, parsed once.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ErrorSignals {
    error_code: Option<String>,
    detail: Detail,
}

impl ErrorSignals {
    fn parse(body: &serde_json::Value) -> Self {
        let error_code = body.get("error_code").and_then(|v| v.as_str()).map(str::to_owned);
        let detail = match body.get("detail") {
            Some(serde_json::Value::String(s)) => Detail::Text(s.clone()),
            Some(serde_json::Value::Object(obj)) => Detail::Object {
                code: ["errorCode", "error_code", "code"]
                    .iter()
                    .find_map(|k| obj.get(*k).and_then(|v| v.as_str()))
                    .map(str::to_owned),
            },
            _ => Detail::Absent,
        };
        Self { error_code, detail }
    }

    /// Top-level code equals, string detail contains, or detail object code
    /// equals `code`.
    fn carries(&self, code: &str) -> bool {
        if self.error_code.as_deref() == Some(code) {
            return true;
        }
        match &self.detail {
            Detail::Text(text) => text.contains(code),
            Detail::Object { code: Some(c) } => c == code,
            _ => false,
        }
    }

    fn token_expired(&self) -> bool {
        matches!(&self.detail, Detail::Object { code: Some(c) } if c == TOKEN_EXPIRED)
    }
}

/// Classify a response by status and parsed body.
pub fn classify(status: u16, body: &serde_json::Value) -> AuthCondition {
    let signals = ErrorSignals::parse(body);
    if status == 401 && signals.token_expired() {
        return AuthCondition::TokenExpired;
    }
    if signals.carries(LOGIN_REQUIRED) {
        return AuthCondition::LoginRequired;
    }
    if signals.carries(SUBSCRIPTION_REQUIRED) {
        return AuthCondition::SubscriptionRequired;
    }
    AuthCondition::None
}

/// Classify raw body bytes. Non-JSON bodies carry no condition.
pub fn classify_bytes(status: u16, body: &[u8]) -> AuthCondition {
    let value = serde_json::from_slice(body).unwrap_or(serde_json::Value::Null);
    classify(status, &value)
}

/// Classify a bare error code, as carried by a stream error event.
pub fn classify_error_code(code: &str) -> AuthCondition {
    match code {
        LOGIN_REQUIRED => AuthCondition::LoginRequired,
        SUBSCRIPTION_REQUIRED => AuthCondition::SubscriptionRequired,
        _ => AuthCondition::None,
    }
}

#[cfg(test)]
#[path = "classify_tests.rs"]
mod tests;
