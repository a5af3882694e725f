// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token records, the shared token store, error classification and the
//! coordinated refresh that keeps the access token valid.

pub mod classify;
pub mod refresh;
pub mod token_store;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use classify::{classify, AuthCondition};
pub use refresh::{RefreshCoordinator, RefreshSettings};
pub use token_store::TokenStore;

/// Store key for the serialized [`AuthTokenRecord`].
pub const AUTH_INFO_KEY: &str = "auth_info";
/// Store key for the serialized [`AuthLockRecord`].
pub const AUTH_LOCK_KEY: &str = "auth_refresh_lock";
/// Store key for the anonymous correlation identifier.
pub const ANONYMOUS_ID_KEY: &str = "unauthenticated_user_id";

/// A credential together with its expiry. Token and expiry are never stored
/// apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiringToken {
    pub token: String,
    /// Expiry as epoch millis.
    pub expires_at: u64,
}

impl ExpiringToken {
    /// A token valid for `secs` seconds from `now_ms`. Saturates at
    /// `u64::MAX` rather than wrapping.
    pub fn expiring_in(token: impl Into<String>, now_ms: u64, secs: u64) -> Self {
        Self { token: token.into(), expires_at: now_ms.saturating_add(secs.saturating_mul(1000)) }
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

/// Snapshot of the signed-in user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
}

/// The persisted session: access and refresh tokens plus who they belong to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTokenRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<ExpiringToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<ExpiringToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
}

impl AuthTokenRecord {
    pub fn access_token(&self) -> Option<&str> {
        self.access.as_ref().map(|t| t.token.as_str())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh.as_ref().map(|t| t.token.as_str())
    }

    pub fn has_token_pair(&self) -> bool {
        self.access.is_some() && self.refresh.is_some()
    }

    /// Both tokens present and the access token not yet expired.
    pub fn is_usable_at(&self, now_ms: u64) -> bool {
        match (&self.access, &self.refresh) {
            (Some(access), Some(_)) => !access.is_expired_at(now_ms),
            _ => false,
        }
    }
}

/// Cross-process refresh lock marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthLockRecord {
    /// Unique per acquisition attempt.
    pub id: String,
    /// Acquisition instant as epoch millis.
    pub acquired_at: u64,
}

impl AuthLockRecord {
    pub fn new(now_ms: u64) -> Self {
        Self { id: format!("{now_ms}-{}", uuid::Uuid::new_v4().simple()), acquired_at: now_ms }
    }

    /// A lock older than `ttl` is abandoned, released or not.
    pub fn is_live_at(&self, now_ms: u64, ttl: Duration) -> bool {
        now_ms.saturating_sub(self.acquired_at) < ttl.as_millis() as u64
    }
}

/// Process-wide auth notifications.
///
/// Every caller that hits a login or subscription wall publishes here so
/// independent consumers can react without re-deriving the condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuthEvent {
    /// A refresh performed by this process stored a new token record.
    Refreshed { session_id: Option<String> },
    /// The refresh endpoint failed; the token record has been cleared.
    RefreshFailed { error: String },
    LoginRequired,
    SubscriptionRequired,
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
