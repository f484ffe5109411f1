//! Per-request measurement sink and error taxonomy.
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use k8s_openapi::chrono::{DateTime, Utc};
use kubeload_common::report::{ResponseError, ResponseErrorKind, ResponseStats};

/// A failed request observation, before classification.
#[derive(Debug)]
pub enum RequestError {
    /// The apiserver answered with a non-success status.
    Status(reqwest::StatusCode),
    /// The request failed below the HTTP layer.
    Transport(reqwest::Error),
}

/// Thread-safe sink for latencies, received bytes, and typed error tallies.
///
/// One coarse mutex is enough here: workers spend their time in network
/// I/O, not in metric bookkeeping. The byte counter is atomic so body
/// streaming never takes the lock.
#[derive(Default)]
pub struct ResponseMetric {
    received_bytes: AtomicI64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    errors: Vec<ResponseError>,
    latencies_by_url: BTreeMap<String, Vec<f64>>,
}

impl ResponseMetric {
    /// New empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful request's latency, keyed by its URL.
    pub fn observe_latency(&self, url: &str, seconds: f64) {
        let mut inner = self.inner.lock().expect("metric lock poisoned");
        inner
            .latencies_by_url
            .entry(url.to_owned())
            .or_default()
            .push(seconds);
    }

    /// Record a failed request, classified into the error taxonomy.
    pub fn observe_failure(&self, now: DateTime<Utc>, seconds: f64, err: &RequestError) {
        let mut oerr = ResponseError {
            timestamp: now,
            duration: seconds,
            kind: ResponseErrorKind::Unknown,
            code: None,
            message: String::new(),
        };

        match err {
            RequestError::Status(status) => {
                oerr.kind = ResponseErrorKind::Http;
                oerr.code = Some(status.as_u16());
            }
            RequestError::Transport(err) => {
                // HTTP code -> HTTP/2 -> connection -> unknown.
                if let Some(message) = http2_error(err) {
                    oerr.kind = ResponseErrorKind::Http2Protocol;
                    oerr.message = message;
                } else if let Some(message) = connection_error(err) {
                    oerr.kind = ResponseErrorKind::Connection;
                    oerr.message = message;
                } else {
                    oerr.message = err.to_string();
                }
            }
        }

        let mut inner = self.inner.lock().expect("metric lock poisoned");
        inner.errors.push(oerr);
    }

    /// Add to the received-byte counter.
    pub fn observe_received_bytes(&self, bytes: i64) {
        self.received_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Snapshot everything observed so far.
    pub fn gather(&self) -> ResponseStats {
        let inner = self.inner.lock().expect("metric lock poisoned");
        ResponseStats {
            errors: inner.errors.clone(),
            latencies_by_url: inner.latencies_by_url.clone(),
            total_received_bytes: self.received_bytes.load(Ordering::Relaxed),
        }
    }
}

/// True when the error is an HTTP/2 RST_STREAM with code NO_ERROR.
///
/// Per RFC 7540 section 8.1 a server may reset the stream without error
/// after sending a complete response. Responses read to completion before
/// such a reset must not be discarded.
pub fn is_http2_stream_no_error(err: &reqwest::Error) -> bool {
    matches!(h2_error(err), Some(h2) if h2.is_reset() && h2.reason() == Some(h2::Reason::NO_ERROR))
}

fn h2_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a h2::Error> {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(err) = source {
        if let Some(h2) = err.downcast_ref::<h2::Error>() {
            return Some(h2);
        }
        source = err.source();
    }
    None
}

// Decode HTTP/2 framing failures: connection errors, stream resets, and
// GOAWAY frames.
fn http2_error(err: &reqwest::Error) -> Option<String> {
    let h2 = h2_error(err)?;
    if h2.is_go_away() {
        let reason = h2
            .reason()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_owned());
        return Some(format!(
            "http2: server sent GOAWAY and closed the connection; code={reason}"
        ));
    }
    match h2.reason() {
        Some(reason) => Some(reason.to_string()),
        None => Some(h2.to_string()),
    }
}

// Connection-level failures: timeouts, refused/reset connections, truncated
// bodies, TLS handshake problems.
fn connection_error(err: &reqwest::Error) -> Option<String> {
    if err.is_timeout() {
        return Some(err.to_string());
    }
    if let Some(message) = connection_class(err) {
        return Some(message);
    }
    if err.is_connect() {
        return Some(err.to_string());
    }
    None
}

fn connection_class(err: &(dyn StdError + 'static)) -> Option<String> {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            match io.kind() {
                ErrorKind::ConnectionRefused => return Some("connection refused".to_owned()),
                ErrorKind::ConnectionReset => return Some("connection reset by peer".to_owned()),
                ErrorKind::UnexpectedEof => return Some("unexpected EOF".to_owned()),
                ErrorKind::TimedOut => return Some(io.to_string()),
                _ => {}
            }
        }
        source = cause.source();
    }

    let chain = error_chain(err);
    if chain.contains("connection refused") {
        return Some("connection refused".to_owned());
    }
    if chain.contains("connection reset") {
        return Some("connection reset by peer".to_owned());
    }
    if chain.contains("unexpected eof") || chain.contains("incomplete message") {
        return Some("unexpected EOF".to_owned());
    }
    if chain.contains("tls handshake") {
        return Some("TLS handshake failure".to_owned());
    }
    None
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = Vec::new();
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(err) = source {
        parts.push(err.to_string().to_lowercase());
        source = err.source();
    }
    parts.join(": ")
}
