use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::event::LogWriter;

pub const STREAM_CONTENT_TYPE: &str = "application/x-json-stream";

const DEFAULT_FILL: &[u8] = b"\n";

/// One frame of a JSON stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JsonMessage {
    #[serde(default)]
    pub message: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

struct KeepAliveInner {
    tx: mpsc::UnboundedSender<Bytes>,
    fill: Bytes,
    last_write: Mutex<Instant>,
    stopped: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl KeepAliveInner {
    fn send(&self, data: Bytes) -> bool {
        *self.last_write.lock() = Instant::now();
        self.tx.send(data).is_ok()
    }
}

/// Unbuffered writer over a response body that emits a fill string
/// whenever the connection has been idle for a whole interval.
#[derive(Clone)]
pub struct KeepAliveWriter {
    inner: Arc<KeepAliveInner>,
}

impl KeepAliveWriter {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>, interval: Duration, fill: Option<&str>) -> Self {
        let fill = match fill {
            Some(f) if !f.is_empty() => Bytes::copy_from_slice(f.as_bytes()),
            _ => Bytes::from_static(DEFAULT_FILL),
        };
        let inner = Arc::new(KeepAliveInner {
            tx,
            fill,
            last_write: Mutex::new(Instant::now()),
            stopped: AtomicBool::new(false),
            ticker: Mutex::new(None),
        });
        let ticker = tokio::spawn(keep_alive(Arc::downgrade(&inner), interval));
        *inner.ticker.lock() = Some(ticker);
        Self { inner }
    }

    /// Returns false once the client is gone.
    pub fn write(&self, data: impl Into<Bytes>) -> bool {
        self.inner.send(data.into())
    }

    /// Stop the timer. Safe to call more than once.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(ticker) = self.inner.ticker.lock().take() {
            ticker.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

async fn keep_alive(inner: std::sync::Weak<KeepAliveInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { return };
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        if inner.last_write.lock().elapsed() < interval {
            continue;
        }
        if !inner.send(inner.fill.clone()) {
            debug!("keep-alive stopped, client disconnected");
            return;
        }
    }
}

/// Encodes every write as one [`JsonMessage`] frame.
#[derive(Clone)]
pub struct JsonMessageWriter {
    keep_alive: KeepAliveWriter,
}

impl JsonMessageWriter {
    pub fn new(keep_alive: KeepAliveWriter) -> Self {
        Self { keep_alive }
    }

    fn send(&self, msg: &JsonMessage) {
        match serde_json::to_vec(msg) {
            Ok(mut frame) => {
                frame.push(b'\n');
                if !self.keep_alive.write(frame) {
                    debug!("dropping stream frame, client disconnected");
                }
            }
            Err(e) => warn!("unable to encode stream frame: {}", e),
        }
    }

    pub fn write_message(&self, message: impl Into<String>) {
        let message = message.into();
        if message.is_empty() {
            return;
        }
        self.send(&JsonMessage {
            message,
            timestamp: Utc::now(),
            error: String::new(),
        });
    }

    /// Write a line, adding the trailing newline when missing.
    pub fn line(&self, message: impl std::fmt::Display) {
        let mut line = message.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.write_message(line);
    }

    pub fn write_error(&self, error: impl Into<String>) {
        self.send(&JsonMessage {
            message: String::new(),
            timestamp: Utc::now(),
            error: error.into(),
        });
    }

    pub fn keep_alive(&self) -> &KeepAliveWriter {
        &self.keep_alive
    }
}

impl LogWriter for JsonMessageWriter {
    fn write_log(&self, data: &[u8]) {
        self.write_message(String::from_utf8_lossy(data).into_owned());
    }
}

/// Respond with a JSON stream fed by `work`.
///
/// Status and headers go out immediately; an error returned by `work`
/// becomes the final `Error` frame.
pub fn streamed<F, Fut>(interval: Duration, work: F) -> Response
where
    F: FnOnce(JsonMessageWriter) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ApiError>> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
    let keep_alive = KeepAliveWriter::new(tx, interval, None);
    let writer = JsonMessageWriter::new(keep_alive.clone());

    tokio::spawn(async move {
        let handle = tokio::spawn(work(writer.clone()));
        let outcome = match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(ApiError::internal_server_error("handler panicked")),
            Err(_) => Err(ApiError::internal_server_error("handler canceled")),
        };
        if let Err(err) = outcome {
            writer.write_error(err.message());
        }
        keep_alive.stop();
    });

    let body = UnboundedReceiverStream::new(rx).map(Ok::<Bytes, Infallible>);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, STREAM_CONTENT_TYPE)],
        Body::from_stream(body),
    )
        .into_response()
}

/// Decode every frame of a finished stream body, skipping fill lines.
pub fn parse_frames(body: &[u8]) -> Result<Vec<JsonMessage>, serde_json::Error> {
    body.split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map(serde_json::from_slice)
        .collect()
}
