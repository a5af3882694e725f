// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use super::*;
use crate::auth::ExpiringToken;
use crate::store::{FileStore, MemoryStore};

fn record(access: &str) -> AuthTokenRecord {
    AuthTokenRecord {
        access: Some(ExpiringToken { token: access.to_owned(), expires_at: u64::MAX }),
        refresh: Some(ExpiringToken { token: "refresh".to_owned(), expires_at: u64::MAX }),
        session_id: Some("sess".to_owned()),
        user: None,
    }
}

#[test]
fn write_read_clear() -> anyhow::Result<()> {
    let store = TokenStore::new(Arc::new(MemoryStore::new()));
    assert_eq!(store.read()?, None);

    store.write(&record("a1"))?;
    assert_eq!(store.read()?, Some(record("a1")));

    store.clear()?;
    assert_eq!(store.read()?, None);
    assert_eq!(store.current(), None);
    Ok(())
}

#[tokio::test]
async fn write_notifies_subscribers() -> anyhow::Result<()> {
    let store = TokenStore::new(Arc::new(MemoryStore::new()));
    let mut rx = store.subscribe();

    store.write(&record("a1"))?;
    rx.changed().await?;
    assert_eq!(rx.borrow().as_ref().and_then(|r| r.access_token().map(str::to_owned)), Some("a1".to_owned()));
    Ok(())
}

#[test]
fn read_picks_up_writes_from_another_process() -> anyhow::Result<()> {
    let kv = Arc::new(MemoryStore::new());
    let tab_a = TokenStore::new(Arc::clone(&kv) as Arc<dyn KvStore>);
    let tab_b = TokenStore::new(kv);

    tab_a.write(&record("from-a"))?;
    assert_eq!(tab_b.current(), None);
    assert_eq!(tab_b.read()?, Some(record("from-a")));
    assert_eq!(tab_b.current(), Some(record("from-a")));
    Ok(())
}

#[test]
fn initial_view_loaded_from_store() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    TokenStore::new(Arc::new(FileStore::open(dir.path())?)).write(&record("persisted"))?;

    let reopened = TokenStore::new(Arc::new(FileStore::open(dir.path())?));
    assert_eq!(reopened.current(), Some(record("persisted")));
    Ok(())
}

#[test]
fn lock_write_and_clear() -> anyhow::Result<()> {
    let store = TokenStore::new(Arc::new(MemoryStore::new()));
    let lock = AuthLockRecord::new(1_000);
    store.write_lock(Some(&lock))?;
    assert_eq!(store.read_lock()?, Some(lock));
    store.write_lock(None)?;
    assert_eq!(store.read_lock()?, None);
    Ok(())
}

#[test]
fn corrupt_entry_reads_as_absent() -> anyhow::Result<()> {
    let kv = Arc::new(MemoryStore::new());
    kv.set(AUTH_INFO_KEY, "{not json")?;
    let store = TokenStore::new(kv);
    assert_eq!(store.read()?, None);
    Ok(())
}

#[test]
fn anonymous_id_round_trip() -> anyhow::Result<()> {
    let store = TokenStore::new(Arc::new(MemoryStore::new()));
    assert_eq!(store.anonymous_id()?, None);
    store.set_anonymous_id("anon-7")?;
    assert_eq!(store.anonymous_id()?.as_deref(), Some("anon-7"));
    Ok(())
}
