// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end tests: file-backed token store, real HTTP against an in-process
//! mock backend, several coordinators standing in for separate processes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use glossa::auth::{AuthEvent, AuthLockRecord, RefreshCoordinator, RefreshSettings, TokenStore};
use glossa::client::{ApiClient, ANONYMOUS_ID_HEADER};
use glossa::error::RequestError;
use glossa::request::RequestDescriptor;
use glossa::store::FileStore;
use glossa::stream::StreamEvent;
use glossa::test_support::{sample_record, MockBackend, MockResponse};
use glossa::{epoch_ms, http_client};

fn open_store(dir: &Path) -> anyhow::Result<Arc<TokenStore>> {
    Ok(Arc::new(TokenStore::new(Arc::new(FileStore::open(dir)?))))
}

/// One "tab": its own store handle, coordinator and client over `dir`.
fn tab(dir: &Path, backend: &MockBackend) -> anyhow::Result<ApiClient> {
    let mut settings = RefreshSettings::new(backend.refresh_url());
    settings.lock_ttl = Duration::from_secs(2);
    settings.poll_interval = Duration::from_millis(20);
    let refresher = RefreshCoordinator::new(open_store(dir)?, http_client(None), settings);
    Ok(ApiClient::new(backend.base_url(), http_client(None), refresher))
}

fn ok_body() -> MockResponse {
    MockResponse::json(200, serde_json::json!({"summary": "short"}))
}

#[tokio::test]
async fn expired_token_is_refreshed_and_persisted() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    open_store(dir.path())?.write(&sample_record("a1", "r1"))?;
    let backend = MockBackend::start(
        vec![MockResponse::token_expired(), ok_body()],
        vec![MockResponse::refreshed("a2", "r2")],
    )
    .await?;
    let client = tab(dir.path(), &backend)?;

    let resp = client.execute(&RequestDescriptor::get("/api/summarize")).await?;

    assert_eq!(resp.status, 200);
    assert_eq!(backend.api_calls(), 2);
    assert_eq!(backend.refresh_calls(), 1);

    // A process started later sees the refreshed pair.
    let reopened = open_store(dir.path())?.read()?;
    assert_eq!(reopened.as_ref().and_then(|r| r.access_token()), Some("a2"));
    assert_eq!(reopened.as_ref().and_then(|r| r.refresh_token()), Some("r2"));
    assert_eq!(open_store(dir.path())?.read_lock()?, None);
    Ok(())
}

#[tokio::test]
async fn login_required_never_refreshes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    open_store(dir.path())?.write(&sample_record("a1", "r1"))?;
    let backend = MockBackend::start(vec![MockResponse::login_required(401)], vec![]).await?;
    let client = tab(dir.path(), &backend)?;
    let mut events = client.subscribe();

    let err = client.execute(&RequestDescriptor::get("/api/summarize")).await.err();

    assert!(matches!(err, Some(RequestError::LoginRequired)));
    assert_eq!(backend.refresh_calls(), 0);
    assert_eq!(events.try_recv()?, AuthEvent::LoginRequired);
    Ok(())
}

#[tokio::test]
async fn waiting_tab_adopts_token_refreshed_elsewhere() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let other_tab = open_store(dir.path())?;
    other_tab.write(&sample_record("a1", "r1"))?;
    other_tab.write_lock(Some(&AuthLockRecord::new(epoch_ms())))?;

    let backend = MockBackend::start(
        vec![MockResponse::token_expired(), ok_body()],
        vec![MockResponse::refreshed("never", "never")],
    )
    .await?;
    let client = tab(dir.path(), &backend)?;

    let request = tokio::spawn(async move {
        client.execute(&RequestDescriptor::get("/api/summarize")).await
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    other_tab.write(&sample_record("a2-elsewhere", "r2-elsewhere"))?;
    other_tab.write_lock(None)?;

    let resp = request.await??;
    assert_eq!(resp.status, 200);
    assert_eq!(backend.refresh_calls(), 0);
    assert_eq!(backend.seen()[1].authorization.as_deref(), Some("Bearer a2-elsewhere"));
    Ok(())
}

#[tokio::test]
async fn concurrent_requests_in_one_tab_share_a_refresh() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    open_store(dir.path())?.write(&sample_record("a1", "r1"))?;
    let backend = MockBackend::start(
        vec![
            MockResponse::token_expired(),
            MockResponse::token_expired(),
            MockResponse::token_expired(),
            ok_body(),
        ],
        // Slow enough that every 401 lands while the refresh is in flight.
        vec![MockResponse::refreshed("a2", "r2").with_delay(Duration::from_millis(300))],
    )
    .await?;
    let client = tab(dir.path(), &backend)?;

    let req = RequestDescriptor::get("/api/summarize");
    let (a, b, c) = tokio::join!(client.execute(&req), client.execute(&req), client.execute(&req));

    assert_eq!(a?.status, 200);
    assert_eq!(b?.status, 200);
    assert_eq!(c?.status, 200);
    assert_eq!(backend.refresh_calls(), 1);
    assert_eq!(backend.api_calls(), 6);
    Ok(())
}

#[tokio::test]
async fn correlation_id_survives_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let backend = MockBackend::start(
        vec![ok_body().with_header(ANONYMOUS_ID_HEADER, "anon-42"), ok_body()],
        vec![],
    )
    .await?;

    let first = tab(dir.path(), &backend)?;
    first.execute(&RequestDescriptor::get("/api/public").anonymous()).await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while open_store(dir.path())?.anonymous_id()?.is_none() {
        assert!(tokio::time::Instant::now() < deadline, "correlation id never persisted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    drop(first);

    let second = tab(dir.path(), &backend)?;
    second.execute(&RequestDescriptor::get("/api/public").anonymous()).await?;

    let seen = backend.seen();
    assert_eq!(seen[1].anonymous_id.as_deref(), Some("anon-42"));
    assert_eq!(seen[1].authorization, None);
    Ok(())
}

#[tokio::test]
async fn cancel_after_two_deltas_is_silent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    open_store(dir.path())?.write(&sample_record("a1", "r1"))?;
    let backend = MockBackend::start(vec![], vec![]).await?;
    let client = tab(dir.path(), &backend)?;
    let mut auth_events = client.subscribe();

    backend.push_chunk("data: {\"chunk\":\"Ephem\",\"accumulated\":\"Ephem\"}\n");
    backend.push_chunk("data: {\"chunk\":\"eral\",\"accumulated\":\"Ephemeral\"}\n");

    let cancel = CancellationToken::new();
    let req = RequestDescriptor::post("/stream").cancel_with(cancel.clone());
    let mut events = client.execute_stream(&req).await?;

    let mut deltas = Vec::new();
    while deltas.len() < 2 {
        match events.next().await {
            Some(Ok(StreamEvent::Delta { accumulated, .. })) => deltas.push(accumulated),
            other => anyhow::bail!("unexpected item {other:?}"),
        }
    }
    assert_eq!(deltas, vec![Some("Ephem".to_owned()), Some("Ephemeral".to_owned())]);

    cancel.cancel();
    backend.push_chunk("data: {\"type\":\"error\",\"code\":\"LOGIN_REQUIRED\"}\n");
    backend.end_stream();

    assert!(events.next().await.is_none());
    assert!(matches!(auth_events.try_recv(), Err(TryRecvError::Empty)));
    Ok(())
}
