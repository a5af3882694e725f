// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use bytes::Bytes;

/// Terminal outcome of a failed [`crate::client::ApiClient`] call.
///
/// `TokenExpired` has no variant here: it is absorbed by the client's single
/// refresh-and-retry and never reaches callers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    /// Transport failure, no response received.
    #[error("network error: {0}")]
    Network(String),
    /// Non-2xx response without a recognized auth condition.
    #[error("http {status}: {}", String::from_utf8_lossy(body))]
    Http { status: u16, body: Bytes },
    #[error("login required")]
    LoginRequired,
    #[error("subscription required")]
    SubscriptionRequired,
    /// Streamed body could not be read.
    #[error("stream error: {0}")]
    Stream(String),
    /// The caller cancelled the request. Not an error condition.
    #[error("aborted")]
    Aborted,
}

impl RequestError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// True for the outcomes that should prompt the user to sign in again.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::LoginRequired | Self::SubscriptionRequired)
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Failure of a coordinated token refresh.
///
/// Cloneable because every caller attached to one in-flight refresh receives
/// the same result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshError {
    #[error("no refresh token stored")]
    NoRefreshToken,
    #[error("refresh request failed: {0}")]
    Network(String),
    #[error("refresh rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("refresh response carried no usable token pair")]
    MissingTokens,
    #[error("token store: {0}")]
    Store(String),
    #[error("refresh task failed: {0}")]
    Task(String),
}

impl RefreshError {
    /// The stored session can no longer be refreshed and must be discarded.
    /// Transport, storage and task failures leave the session in place.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NoRefreshToken | Self::Rejected { .. } | Self::MissingTokens)
    }
}

impl From<anyhow::Error> for RefreshError {
    fn from(e: anyhow::Error) -> Self {
        Self::Store(format!("{e:#}"))
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
