// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Incremental decoder for `data:`-framed streamed responses.

use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::auth::classify::{classify, classify_error_code};
use crate::auth::AuthCondition;
use crate::error::RequestError;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// One application event decoded from a streamed response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental text plus the producer's running total, used verbatim.
    Delta { chunk: String, accumulated: Option<String> },
    Complete { payload: serde_json::Value },
    Error { code: String, message: String, condition: AuthCondition },
}

/// Line-buffered decoder. Frames may be split at any byte offset across
/// chunks; the unterminated tail stays buffered until its newline arrives.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    line_buf: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return the events completed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.line_buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.line_buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.line_buf[start..end]);
            if let Some(event) = decode_line(line.trim_end_matches('\r')) {
                events.push(event);
            }
            start = end + 1;
        }
        self.line_buf.drain(..start);
        events
    }

    /// Bytes waiting for a newline.
    pub fn pending(&self) -> usize {
        self.line_buf.len()
    }
}

/// Decode one complete line. Returns `None` for lines that carry no event.
fn decode_line(line: &str) -> Option<StreamEvent> {
    if line.trim().is_empty() {
        return None;
    }
    let data = line.strip_prefix(DATA_PREFIX)?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.trim() == DONE_SENTINEL {
        return None;
    }

    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            debug!(err = %e, line = %truncate(data, 120), "dropping unparseable stream frame");
            return None;
        }
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("complete") => Some(StreamEvent::Complete { payload: value }),
        Some("error") => Some(error_event(&value)),
        _ => {
            let chunk = value.get("chunk")?.as_str()?.to_owned();
            let accumulated =
                value.get("accumulated").and_then(|v| v.as_str()).map(str::to_owned);
            Some(StreamEvent::Delta { chunk, accumulated })
        }
    }
}

fn error_event(value: &serde_json::Value) -> StreamEvent {
    let field = |names: &[&str]| {
        names.iter().find_map(|k| value.get(*k).and_then(|v| v.as_str())).map(str::to_owned)
    };
    let code = field(&["error_code", "code"]).unwrap_or_default();
    let message = field(&["message", "detail", "error"]).unwrap_or_default();

    // Stream errors are never 401-expired; only login/subscription apply.
    let condition = match classify(200, value) {
        AuthCondition::None => classify_error_code(&code),
        other => other,
    };
    StreamEvent::Error { code, message, condition }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Boxed event stream handed to callers.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, RequestError>> + Send>>;

/// Decode a byte stream lazily.
///
/// Ends when the input ends (discarding an unterminated tail), after a single
/// [`RequestError::Stream`] on a read failure, or silently when `cancel`
/// fires. Dropping the returned stream drops the underlying body.
pub fn decode_stream<S, E>(chunks: S, cancel: CancellationToken) -> EventStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut decoder = StreamDecoder::new();
        let mut chunks = Box::pin(chunks);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("stream cancelled");
                    return;
                }
                next = chunks.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    for event in decoder.feed(&chunk) {
                        if cancel.is_cancelled() {
                            return;
                        }
                        yield Ok(event);
                    }
                }
                Some(Err(e)) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    yield Err(RequestError::Stream(e.to_string()));
                    return;
                }
                None => {
                    if decoder.pending() > 0 {
                        debug!(bytes = decoder.pending(), "discarding unterminated stream tail");
                    }
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;
