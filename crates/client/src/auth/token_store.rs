// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed accessor over the shared [`KvStore`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::auth::{AuthLockRecord, AuthTokenRecord, ANONYMOUS_ID_KEY, AUTH_INFO_KEY, AUTH_LOCK_KEY};
use crate::store::KvStore;

/// Token record, refresh lock and correlation id, each one store key.
///
/// Writes to the token record are also published on a watch channel so
/// in-process callers see the new token without reading the store again.
pub struct TokenStore {
    kv: Arc<dyn KvStore>,
    current: watch::Sender<Option<AuthTokenRecord>>,
}

impl TokenStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        let initial = read_json::<AuthTokenRecord>(kv.as_ref(), AUTH_INFO_KEY).unwrap_or_else(|e| {
            warn!(err = %e, "failed to read stored token record");
            None
        });
        let (current, _) = watch::channel(initial);
        Self { kv, current }
    }

    /// Read the token record from the store, refreshing the local view if
    /// another process changed it.
    pub fn read(&self) -> anyhow::Result<Option<AuthTokenRecord>> {
        let record = read_json::<AuthTokenRecord>(self.kv.as_ref(), AUTH_INFO_KEY)?;
        self.current.send_if_modified(|cur| {
            if *cur == record {
                false
            } else {
                cur.clone_from(&record);
                true
            }
        });
        Ok(record)
    }

    /// Replace the token record wholesale.
    pub fn write(&self, record: &AuthTokenRecord) -> anyhow::Result<()> {
        write_json(self.kv.as_ref(), AUTH_INFO_KEY, record)?;
        self.current.send_replace(Some(record.clone()));
        debug!(session_id = ?record.session_id, "token record written");
        Ok(())
    }

    /// Delete the token record (logout or unrecoverable refresh failure).
    pub fn clear(&self) -> anyhow::Result<()> {
        self.kv.remove(AUTH_INFO_KEY)?;
        self.current.send_replace(None);
        debug!("token record cleared");
        Ok(())
    }

    pub fn read_lock(&self) -> anyhow::Result<Option<AuthLockRecord>> {
        read_json(self.kv.as_ref(), AUTH_LOCK_KEY)
    }

    /// Write the lock record, or clear it with `None`.
    pub fn write_lock(&self, lock: Option<&AuthLockRecord>) -> anyhow::Result<()> {
        match lock {
            Some(lock) => write_json(self.kv.as_ref(), AUTH_LOCK_KEY, lock),
            None => self.kv.remove(AUTH_LOCK_KEY),
        }
    }

    pub fn anonymous_id(&self) -> anyhow::Result<Option<String>> {
        Ok(self.kv.get(ANONYMOUS_ID_KEY)?.filter(|id| !id.is_empty()))
    }

    pub fn set_anonymous_id(&self, id: &str) -> anyhow::Result<()> {
        self.kv.set(ANONYMOUS_ID_KEY, id)
    }

    /// Last token record seen by this process.
    pub fn current(&self) -> Option<AuthTokenRecord> {
        self.current.borrow().clone()
    }

    /// Subscribe to token record changes made through this store.
    pub fn subscribe(&self) -> watch::Receiver<Option<AuthTokenRecord>> {
        self.current.subscribe()
    }
}

/// Read and deserialize one key. A value that does not parse is logged and
/// treated as absent.
fn read_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> anyhow::Result<Option<T>> {
    let Some(raw) = kv.get(key)? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(key, err = %e, "discarding unparseable store entry");
            Ok(None)
        }
    }
}

fn write_json<T: Serialize>(kv: &dyn KvStore, key: &str, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string(value)?;
    kv.set(key, &json)
}

#[cfg(test)]
#[path = "token_store_tests.rs"]
mod tests;
