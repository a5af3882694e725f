// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Glossa: authenticated streaming request core.
//!
//! Keeps an access/refresh token pair valid across every process sharing one
//! state store, executes requests against the explanation API with a single
//! refresh-and-retry on expired tokens, and decodes streamed responses into
//! [`stream::StreamEvent`]s.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod request;
pub mod store;
pub mod stream;
pub mod test_support;

use std::sync::Once;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static CRYPTO_INIT: Once = Once::new();

/// Install the rustls crypto provider (needed for reqwest even on plain HTTP).
pub fn ensure_crypto_provider() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Build the shared HTTP client used for API and refresh calls.
pub fn http_client(timeout: Option<Duration>) -> reqwest::Client {
    ensure_crypto_provider();
    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("glossa/", env!("CARGO_PKG_VERSION")));
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().unwrap_or_default()
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
