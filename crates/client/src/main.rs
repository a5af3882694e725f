// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use futures_util::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use glossa::auth::{AuthTokenRecord, ExpiringToken, RefreshCoordinator, TokenStore};
use glossa::client::ApiClient;
use glossa::config::{Command, Config};
use glossa::error::RequestError;
use glossa::request::RequestDescriptor;
use glossa::store::FileStore;
use glossa::stream::StreamEvent;
use glossa::{epoch_ms, http_client};

/// Exit code for a request cancelled with Ctrl-C.
const EXIT_CANCELLED: i32 = 130;
const EXIT_LOGIN_REQUIRED: i32 = 3;
const EXIT_SUBSCRIPTION_REQUIRED: i32 = 4;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    init_tracing(&config);

    match run(config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("fatal: {e:#}");
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));

    // stdout carries command output; logs go to stderr.
    match config.log_format.as_str() {
        "json" => {
            fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).json().init();
        }
        _ => {
            fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
        }
    }
}

async fn run(config: Config) -> anyhow::Result<i32> {
    let state_dir = config.state_dir();
    let store = Arc::new(TokenStore::new(Arc::new(FileStore::open(&state_dir)?)));
    info!(state_dir = %state_dir.display(), "opened token store");

    match config.command.clone() {
        Command::Login {
            access_token,
            access_expires_in,
            refresh_token,
            refresh_expires_in,
            session_id,
        } => {
            let now = epoch_ms();
            let record = AuthTokenRecord {
                access: Some(ExpiringToken::expiring_in(access_token, now, access_expires_in)),
                refresh: Some(ExpiringToken::expiring_in(refresh_token, now, refresh_expires_in)),
                session_id,
                user: None,
            };
            store.write(&record)?;
            println!("signed in");
            Ok(0)
        }
        Command::Logout => {
            store.clear()?;
            println!("signed out");
            Ok(0)
        }
        Command::Status => {
            print_status(&store, &state_dir)?;
            Ok(0)
        }
        Command::Refresh => {
            let refresher =
                RefreshCoordinator::new(store, http_client(config.timeout()), config.refresh_settings());
            match refresher.refresh().await {
                Ok(record) => {
                    println!(
                        "refreshed (session {})",
                        record.session_id.as_deref().unwrap_or("unknown")
                    );
                    Ok(0)
                }
                Err(e) => {
                    eprintln!("refresh failed: {e}");
                    Ok(EXIT_LOGIN_REQUIRED)
                }
            }
        }
        Command::Get { path } => {
            let client = api_client(&config, store, false);
            let req = RequestDescriptor::get(path).cancel_with(ctrl_c_token());
            simple_request(&client, req).await
        }
        Command::Post { path, body } => {
            let client = api_client(&config, store, false);
            let req = with_body(RequestDescriptor::post(path), body.as_deref())?
                .cancel_with(ctrl_c_token());
            simple_request(&client, req).await
        }
        Command::Stream { path, body } => {
            let client = api_client(&config, store, true);
            let req = with_body(RequestDescriptor::post(path), body.as_deref())?
                .cancel_with(ctrl_c_token());
            stream_request(&client, req).await
        }
    }
}

/// Build the client and log every auth event it publishes.
fn api_client(config: &Config, store: Arc<TokenStore>, streaming: bool) -> ApiClient {
    let refresher =
        RefreshCoordinator::new(store, http_client(config.timeout()), config.refresh_settings());
    let timeout = if streaming { None } else { config.timeout() };
    let client = ApiClient::new(&config.api_url, http_client(timeout), refresher);

    let mut events = client.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(event = ?event, "auth event"),
                Err(RecvError::Lagged(n)) => info!(skipped = n, "auth events lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    client
}

fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });
    cancel
}

fn with_body(req: RequestDescriptor, body: Option<&str>) -> anyhow::Result<RequestDescriptor> {
    match body {
        Some(raw) => {
            let value: serde_json::Value = serde_json::from_str(raw)
                .map_err(|e| anyhow::anyhow!("--body is not valid JSON: {e}"))?;
            Ok(req.json(&value))
        }
        None => Ok(req),
    }
}

async fn simple_request(client: &ApiClient, req: RequestDescriptor) -> anyhow::Result<i32> {
    match client.execute(&req).await {
        Ok(resp) => {
            println!("{}", resp.text());
            Ok(0)
        }
        Err(e) => Ok(report(&e)),
    }
}

async fn stream_request(client: &ApiClient, req: RequestDescriptor) -> anyhow::Result<i32> {
    let mut events = match client.execute_stream(&req).await {
        Ok(events) => events,
        Err(e) => return Ok(report(&e)),
    };

    let mut stdout = std::io::stdout();
    let mut code = 0;
    while let Some(item) = events.next().await {
        match item {
            Ok(StreamEvent::Delta { chunk, .. }) => {
                print!("{chunk}");
                stdout.flush()?;
            }
            Ok(StreamEvent::Complete { payload }) => {
                println!();
                println!("{payload}");
            }
            Ok(StreamEvent::Error { code: err_code, message, condition }) => {
                println!();
                eprintln!("error {err_code}: {message}");
                code = match condition {
                    glossa::auth::AuthCondition::LoginRequired => EXIT_LOGIN_REQUIRED,
                    glossa::auth::AuthCondition::SubscriptionRequired => EXIT_SUBSCRIPTION_REQUIRED,
                    _ => 1,
                };
            }
            Err(e) => {
                println!();
                code = report(&e);
            }
        }
    }

    if req.cancel.is_cancelled() {
        println!();
        return Ok(EXIT_CANCELLED);
    }
    Ok(code)
}

/// Print a request failure and map it to an exit code. Cancellation is silent.
fn report(err: &RequestError) -> i32 {
    match err {
        RequestError::Aborted => EXIT_CANCELLED,
        RequestError::LoginRequired => {
            eprintln!("login required: run `glossa login`");
            EXIT_LOGIN_REQUIRED
        }
        RequestError::SubscriptionRequired => {
            eprintln!("subscription required");
            EXIT_SUBSCRIPTION_REQUIRED
        }
        other => {
            eprintln!("error: {other}");
            1
        }
    }
}

fn print_status(store: &TokenStore, state_dir: &std::path::Path) -> anyhow::Result<()> {
    let now = epoch_ms();
    let remaining = |t: &ExpiringToken| t.expires_at.saturating_sub(now) / 1000;
    let record = store.read()?;
    let lock = store.read_lock()?;

    let status = serde_json::json!({
        "state_dir": state_dir.display().to_string(),
        "signed_in": record.as_ref().is_some_and(|r| r.has_token_pair()),
        "session_id": record.as_ref().and_then(|r| r.session_id.clone()),
        "user": record.as_ref().and_then(|r| r.user.clone()),
        "access_expires_in_secs": record.as_ref().and_then(|r| r.access.as_ref()).map(remaining),
        "refresh_expires_in_secs": record.as_ref().and_then(|r| r.refresh.as_ref()).map(remaining),
        "refresh_lock": lock.map(|l| serde_json::json!({
            "id": l.id,
            "age_ms": now.saturating_sub(l.acquired_at),
        })),
        "anonymous_id": store.anonymous_id()?,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
