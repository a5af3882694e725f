// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Coordinated token refresh.
//!
//! At most one refresh runs at a time. Inside a process, concurrent callers
//! share one spawned refresh task. Across processes, a lock record in the
//! shared store marks the refresher; it is acquired by writing it and reading
//! it back, and is abandoned once older than the lock TTL.
//!
//! The write-then-verify acquisition assumes the store serializes single-key
//! operations. It is not linearizable: in a narrow race two processes may
//! both refresh, which the backend tolerates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::{AuthEvent, AuthLockRecord, AuthTokenRecord, ExpiringToken, TokenStore, UserProfile};
use crate::epoch_ms;
use crate::error::RefreshError;

/// Age after which a lock record is treated as abandoned.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_millis(15_000);

/// Interval between lock polls while another process refreshes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub type RefreshResult = Result<AuthTokenRecord, RefreshError>;

type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

/// Refresh endpoint and lock timing.
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    /// Absolute URL of the refresh endpoint.
    pub refresh_url: String,
    pub lock_ttl: Duration,
    pub poll_interval: Duration,
}

impl RefreshSettings {
    pub fn new(refresh_url: impl Into<String>) -> Self {
        Self {
            refresh_url: refresh_url.into(),
            lock_ttl: DEFAULT_LOCK_TTL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Body returned by the refresh endpoint. Expiries are epoch millis.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    access_token_expires_at: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    refresh_token_expires_at: Option<u64>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    user: Option<UserProfile>,
}

impl RefreshResponse {
    fn into_record(self) -> Option<AuthTokenRecord> {
        let access = ExpiringToken {
            token: self.access_token.filter(|t| !t.is_empty())?,
            expires_at: self.access_token_expires_at?,
        };
        let refresh = ExpiringToken {
            token: self.refresh_token.filter(|t| !t.is_empty())?,
            expires_at: self.refresh_token_expires_at?,
        };
        Some(AuthTokenRecord {
            access: Some(access),
            refresh: Some(refresh),
            session_id: self.session_id,
            user: self.user,
        })
    }
}

/// Produces a valid token record with at most one refresh in flight.
///
/// Build one per process and share it by `Arc`.
pub struct RefreshCoordinator {
    store: Arc<TokenStore>,
    http: reqwest::Client,
    settings: RefreshSettings,
    events: broadcast::Sender<AuthEvent>,
    inflight: Mutex<Option<(u64, SharedRefresh)>>,
    generation: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<TokenStore>, http: reqwest::Client, settings: RefreshSettings) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            store,
            http,
            settings,
            events,
            inflight: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.settings
    }

    /// Subscribe to process-wide auth events, including refresh failures.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    /// Publish an auth event to every subscriber in this process.
    pub fn publish(&self, event: AuthEvent) {
        let _ = self.events.send(event);
    }

    /// Whether a refresh is currently in flight in this process.
    pub fn is_refreshing(&self) -> bool {
        self.inflight.lock().is_some()
    }

    /// Obtain a freshly refreshed token record.
    ///
    /// Callers arriving while a refresh is in flight attach to it and receive
    /// the identical result. Dropping the returned future stops observing the
    /// refresh without aborting it.
    pub async fn refresh(self: &Arc<Self>) -> RefreshResult {
        let shared = {
            let mut inflight = self.inflight.lock();
            match inflight.as_ref() {
                Some((_, shared)) => {
                    debug!("joining in-flight refresh");
                    shared.clone()
                }
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    let this = Arc::clone(self);
                    let handle = tokio::spawn(async move {
                        let result = this.coordinate().await;
                        if let Err(ref e) = result {
                            this.fail(e);
                        }
                        this.finish(generation);
                        result
                    });
                    let shared = async move {
                        handle.await.unwrap_or_else(|e| Err(RefreshError::Task(e.to_string())))
                    }
                    .boxed()
                    .shared();
                    *inflight = Some((generation, shared.clone()));
                    shared
                }
            }
        };
        shared.await
    }

    /// Drop the in-flight slot if it still belongs to `generation`.
    fn finish(&self, generation: u64) {
        let mut inflight = self.inflight.lock();
        if inflight.as_ref().is_some_and(|(g, _)| *g == generation) {
            *inflight = None;
        }
    }

    /// Notify listeners of a failed refresh. A terminal failure also signs
    /// out every process; a transient one keeps the session for the next try.
    fn fail(&self, err: &RefreshError) {
        if err.is_terminal() {
            warn!(err = %err, "token refresh failed, clearing session");
            if let Err(e) = self.store.clear() {
                warn!(err = %e, "failed to clear token record");
            }
        } else {
            warn!(err = %err, "token refresh failed, keeping session");
        }
        let _ = self.events.send(AuthEvent::RefreshFailed { error: err.to_string() });
    }

    async fn coordinate(&self) -> RefreshResult {
        let stale_access =
            self.store.read()?.and_then(|r| r.access_token().map(str::to_owned));
        match self.try_acquire()? {
            Some(lock) => self.refresh_holding(lock).await,
            None => self.wait_on_other(stale_access).await,
        }
    }

    /// Optimistically claim the cross-process lock. `None` means another
    /// process holds it.
    fn try_acquire(&self) -> Result<Option<AuthLockRecord>, RefreshError> {
        let now = epoch_ms();
        if let Some(existing) = self.store.read_lock()? {
            if existing.is_live_at(now, self.settings.lock_ttl) {
                debug!(lock_id = %existing.id, "refresh lock held by another process");
                return Ok(None);
            }
            debug!(lock_id = %existing.id, "superseding stale refresh lock");
        }

        let lock = AuthLockRecord::new(now);
        self.store.write_lock(Some(&lock))?;
        match self.store.read_lock()? {
            Some(seen) if seen.id == lock.id => Ok(Some(lock)),
            _ => {
                debug!(lock_id = %lock.id, "lost refresh lock race");
                Ok(None)
            }
        }
    }

    async fn refresh_holding(&self, lock: AuthLockRecord) -> RefreshResult {
        let result = self.perform_refresh().await;
        self.release(&lock);
        result
    }

    /// Clear the lock only if it is still ours; a TTL takeover may have
    /// replaced it meanwhile.
    fn release(&self, lock: &AuthLockRecord) {
        match self.store.read_lock() {
            Ok(Some(current)) if current.id == lock.id => {
                if let Err(e) = self.store.write_lock(None) {
                    warn!(lock_id = %lock.id, err = %e, "failed to release refresh lock");
                }
            }
            Ok(_) => debug!(lock_id = %lock.id, "refresh lock no longer ours, leaving it"),
            Err(e) => warn!(lock_id = %lock.id, err = %e, "failed to read refresh lock"),
        }
    }

    async fn wait_on_other(&self, stale_access: Option<String>) -> RefreshResult {
        let ttl = self.settings.lock_ttl;
        let deadline = Instant::now() + ttl;

        loop {
            tokio::time::sleep(self.settings.poll_interval).await;

            let now = epoch_ms();
            let lock = self.store.read_lock()?;
            if !matches!(&lock, Some(l) if l.is_live_at(now, ttl)) {
                if let Some(record) = self.store.read()? {
                    if record.is_usable_at(now) && record.access_token() != stale_access.as_deref()
                    {
                        debug!("adopting token refreshed by another process");
                        return Ok(record);
                    }
                }
                info!("refresh lock released without a usable token, taking over");
                return self.take_over().await;
            }

            if Instant::now() >= deadline {
                warn!(
                    lock_id = ?lock.map(|l| l.id),
                    "refresh lock still held at deadline, taking over"
                );
                self.store.write_lock(None)?;
                return self.take_over().await;
            }
        }
    }

    async fn take_over(&self) -> RefreshResult {
        let lock = AuthLockRecord::new(epoch_ms());
        self.store.write_lock(Some(&lock))?;
        self.refresh_holding(lock).await
    }

    /// Exchange the stored refresh token for a new record and store it.
    async fn perform_refresh(&self) -> RefreshResult {
        let current = self.store.read()?;
        let refresh_token = current
            .as_ref()
            .and_then(|r| r.refresh_token())
            .ok_or(RefreshError::NoRefreshToken)?;

        debug!(url = %self.settings.refresh_url, "calling refresh endpoint");
        let resp = self
            .http
            .post(&self.settings.refresh_url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RefreshError::Rejected { status: status.as_u16(), body });
        }

        let body: RefreshResponse =
            resp.json().await.map_err(|e| RefreshError::Network(e.to_string()))?;
        let record = body.into_record().ok_or(RefreshError::MissingTokens)?;
        self.store.write(&record)?;

        info!(session_id = ?record.session_id, "access token refreshed");
        let _ = self.events.send(AuthEvent::Refreshed { session_id: record.session_id.clone() });
        Ok(record)
    }
}

#[cfg(test)]
#[path = "refresh_tests.rs"]
mod tests;
