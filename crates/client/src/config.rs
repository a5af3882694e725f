// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::auth::RefreshSettings;

/// Authenticated client for the explanation API.
#[derive(Debug, Parser)]
#[command(name = "glossa", version, about)]
pub struct Config {
    /// API base URL.
    #[arg(long, env = "GLOSSA_API_URL", default_value = "http://127.0.0.1:8000")]
    pub api_url: String,

    /// Directory holding the shared token store.
    #[arg(long, env = "GLOSSA_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Refresh endpoint path, relative to the API base URL.
    #[arg(long, env = "GLOSSA_REFRESH_PATH", default_value = "/api/auth/refresh")]
    pub refresh_path: String,

    /// Age in ms after which a refresh lock is considered abandoned.
    #[arg(long, env = "GLOSSA_LOCK_TTL_MS", default_value = "15000")]
    pub lock_ttl_ms: u64,

    /// Interval in ms between refresh lock polls.
    #[arg(long, env = "GLOSSA_LOCK_POLL_MS", default_value = "200")]
    pub lock_poll_ms: u64,

    /// Overall timeout for simple requests, in seconds. Streams are unbounded.
    #[arg(long, env = "GLOSSA_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,

    /// Log format (json or text).
    #[arg(long, env = "GLOSSA_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "GLOSSA_LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Store a token pair obtained from the sign-in flow
    Login {
        #[arg(long)]
        access_token: String,
        /// Access token lifetime in seconds
        #[arg(long, default_value = "3600")]
        access_expires_in: u64,
        #[arg(long)]
        refresh_token: String,
        /// Refresh token lifetime in seconds
        #[arg(long, default_value = "2592000")]
        refresh_expires_in: u64,
        #[arg(long)]
        session_id: Option<String>,
    },
    /// Forget the stored token pair
    Logout,
    /// Show token, lock and correlation id state
    Status,
    /// Force a coordinated token refresh
    Refresh,
    /// GET a path and print the body
    Get { path: String },
    /// POST a path and print the body
    Post {
        path: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
    },
    /// POST a path and print streamed events as they arrive
    Stream {
        path: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
    },
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            anyhow::bail!("--api-url must be an http(s) URL: {}", self.api_url);
        }
        if !self.refresh_path.starts_with('/') {
            anyhow::bail!("--refresh-path must start with '/'");
        }
        if self.lock_poll_ms == 0 || self.lock_poll_ms >= self.lock_ttl_ms {
            anyhow::bail!("--lock-poll-ms must be positive and below --lock-ttl-ms");
        }
        match &self.command {
            Command::Get { path } | Command::Post { path, .. } | Command::Stream { path, .. }
                if !path.starts_with('/') =>
            {
                anyhow::bail!("request path must start with '/': {path}");
            }
            _ => {}
        }
        Ok(())
    }

    pub fn refresh_url(&self) -> String {
        format!("{}{}", self.api_url.trim_end_matches('/'), self.refresh_path)
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            refresh_url: self.refresh_url(),
            lock_ttl: Duration::from_millis(self.lock_ttl_ms),
            poll_interval: Duration::from_millis(self.lock_poll_ms),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// State directory: flag or env first, then the XDG state dir.
    pub fn state_dir(&self) -> PathBuf {
        resolve_state_dir(
            self.state_dir.as_deref(),
            std::env::var("XDG_STATE_HOME").ok().as_deref(),
            std::env::var("HOME").ok().as_deref(),
        )
    }
}

/// Resolve the state directory from explicit, `$XDG_STATE_HOME` and `$HOME`
/// values, in that order. Empty values are ignored.
pub fn resolve_state_dir(
    explicit: Option<&Path>,
    xdg_state_home: Option<&str>,
    home: Option<&str>,
) -> PathBuf {
    if let Some(dir) = explicit.filter(|d| !d.as_os_str().is_empty()) {
        return dir.to_path_buf();
    }
    if let Some(xdg) = xdg_state_home.filter(|v| !v.is_empty()) {
        return Path::new(xdg).join("glossa");
    }
    if let Some(home) = home.filter(|v| !v.is_empty()) {
        return Path::new(home).join(".local/state/glossa");
    }
    PathBuf::from(".glossa")
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
