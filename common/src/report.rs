//! Benchmark report types shared between the runner and the coordinator.
use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Percentile cut points reported for every latency distribution.
pub const PERCENTILES: [f64; 6] = [0.0, 0.5, 0.90, 0.95, 0.99, 1.0];

/// Category of an observed response error.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseErrorKind {
    /// No category fits.
    Unknown,
    /// The response carried an HTTP code >= 400.
    Http,
    /// The error originates from the HTTP/2 framing layer.
    Http2Protocol,
    /// Connection level failure, e.g. refused or reset.
    Connection,
}

impl std::fmt::Display for ResponseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResponseErrorKind::Unknown => "unknown",
            ResponseErrorKind::Http => "http",
            ResponseErrorKind::Http2Protocol => "http2-protocol",
            ResponseErrorKind::Connection => "connection",
        };
        f.write_str(name)
    }
}

/// One observed request failure.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ResponseError {
    /// When the error was received.
    pub timestamp: DateTime<Utc>,
    /// Wall clock spent on the request, in seconds.
    pub duration: f64,
    /// Error category.
    #[serde(rename = "type")]
    pub kind: ResponseErrorKind,
    /// HTTP status code. Only set when `kind` is http.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    /// Error message. Empty when `kind` is http.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Snapshot of everything a runner observed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResponseStats {
    /// All observed errors, in observation order.
    pub errors: Vec<ResponseError>,
    /// Observed latencies in seconds, keyed by request URL.
    pub latencies_by_url: BTreeMap<String, Vec<f64>>,
    /// Total bytes read from the apiserver.
    pub total_received_bytes: i64,
}

/// The runner's final report, also the shape of the coordinator's merged
/// summary. `duration` is a human readable duration string.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RunnerReport {
    /// Total number of requests.
    pub total: usize,
    /// Wall clock of the benchmark.
    pub duration: String,
    /// Raw observed errors. Only present when raw data was requested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ResponseError>,
    /// Error counts grouped by `type/code` or `type/message`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub error_stats: BTreeMap<String, i64>,
    /// Total bytes read from the apiserver.
    pub total_received_bytes: i64,
    /// Raw latencies keyed by URL. Only present when raw data was requested.
    #[serde(
        default,
        rename = "latenciesByURL",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub latencies_by_url: BTreeMap<String, Vec<f64>>,
    /// Latency distribution across all requests.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub percentile_latencies: Vec<(f64, f64)>,
    /// Latency distribution per request URL.
    #[serde(
        default,
        rename = "percentileLatenciesByURL",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub percentile_latencies_by_url: BTreeMap<String, Vec<(f64, f64)>>,
}

impl RunnerReport {
    /// Build a report from gathered stats.
    ///
    /// `raw_data` keeps the full latency and error lists in the report in
    /// addition to the aggregates.
    pub fn build(stats: ResponseStats, duration: Duration, total: usize, raw_data: bool) -> Self {
        let all: Vec<f64> = stats
            .latencies_by_url
            .values()
            .flat_map(|l| l.iter().copied())
            .collect();
        let percentile_latencies_by_url = stats
            .latencies_by_url
            .iter()
            .map(|(url, latencies)| (url.clone(), build_percentile_latencies(latencies.clone())))
            .collect();

        RunnerReport {
            total,
            duration: format_duration(duration),
            error_stats: build_error_stats(&stats.errors),
            total_received_bytes: stats.total_received_bytes,
            percentile_latencies: build_percentile_latencies(all),
            percentile_latencies_by_url,
            errors: if raw_data { stats.errors } else { Vec::new() },
            latencies_by_url: if raw_data {
                stats.latencies_by_url
            } else {
                BTreeMap::new()
            },
        }
    }
}

/// Build the latency distribution at the [`PERCENTILES`] cut points.
///
/// For percentile `p` over `n` samples the reported value sits at index
/// `ceil(n * p) - 1`, clamped to zero. Empty input yields an empty result.
pub fn build_percentile_latencies(mut latencies: Vec<f64>) -> Vec<(f64, f64)> {
    if latencies.is_empty() {
        return Vec::new();
    }

    latencies.sort_by(|a, b| a.total_cmp(b));
    let n = latencies.len() as f64;
    PERCENTILES
        .iter()
        .map(|&p| {
            let idx = ((n * p).ceil() as usize).saturating_sub(1);
            (p, latencies[idx])
        })
        .collect()
}

/// Count errors grouped by `http/<code>` for HTTP errors and
/// `<type>/<message>` for everything else.
pub fn build_error_stats(errors: &[ResponseError]) -> BTreeMap<String, i64> {
    let mut stats = BTreeMap::new();
    for err in errors {
        let key = match err.kind {
            ResponseErrorKind::Http => format!("{}/{}", err.kind, err.code.unwrap_or_default()),
            _ => format!("{}/{}", err.kind, err.message),
        };
        *stats.entry(key).or_insert(0) += 1;
    }
    stats
}

/// Render a duration as a human readable string, truncated to milliseconds
/// so reports stay legible.
pub fn format_duration(d: Duration) -> String {
    humantime::format_duration(Duration::from_millis(d.as_millis() as u64)).to_string()
}

/// Parse a duration previously rendered by [`format_duration`].
pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Error envelope used by every coordinator error response.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HttpError {
    /// Human readable error message.
    pub error: String,
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.error)
    }
}

impl std::error::Error for HttpError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_on_mostly_zero_input() {
        let mut ls = vec![0.0; 100];
        ls[0] = 50.0;
        ls[1] = 49.0;
        ls[2] = 1.0;
        let res = build_percentile_latencies(ls);
        assert_eq!(res[0], (0.0, 0.0));
        assert_eq!(res[1], (0.5, 0.0));
        assert_eq!(res[2], (0.9, 0.0));
        assert_eq!(res[3], (0.95, 0.0));
        assert_eq!(res[4], (0.99, 49.0));
        assert_eq!(res[5], (1.0, 50.0));

        let mut ls = vec![0.0; 1000];
        ls[0] = 50.0;
        ls[1] = 49.0;
        ls[2] = -1.0;
        let res = build_percentile_latencies(ls);
        assert_eq!(res[0], (0.0, -1.0));
        assert_eq!(res[4], (0.99, 0.0));
        assert_eq!(res[5], (1.0, 50.0));
    }

    #[test]
    fn percentiles_cover_min_and_max() {
        let ls: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        let res = build_percentile_latencies(ls);
        assert_eq!(res[0], (0.0, 1.0));
        assert_eq!(res[4], (0.99, 99.0));
        assert_eq!(res[5], (1.0, 100.0));
    }

    #[test]
    fn percentiles_empty_input() {
        assert!(build_percentile_latencies(Vec::new()).is_empty());
    }

    #[test]
    fn error_stats_grouping() {
        let now = Utc::now();
        let http = |code| ResponseError {
            timestamp: now,
            duration: 0.1,
            kind: ResponseErrorKind::Http,
            code: Some(code),
            message: String::new(),
        };
        let conn = |message: &str| ResponseError {
            timestamp: now,
            duration: 0.1,
            kind: ResponseErrorKind::Connection,
            code: None,
            message: message.to_owned(),
        };

        let stats = build_error_stats(&[
            http(429),
            http(429),
            http(500),
            conn("connection refused"),
        ]);
        assert_eq!(stats["http/429"], 2);
        assert_eq!(stats["http/500"], 1);
        assert_eq!(stats["connection/connection refused"], 1);
    }

    #[test]
    fn duration_round_trip() {
        let d = Duration::from_millis(207_500);
        let rendered = format_duration(d);
        assert_eq!(parse_duration(&rendered).unwrap(), d);
    }

    #[test]
    fn report_serializes_camel_case() {
        let report = RunnerReport {
            total: 1,
            duration: "1s".to_owned(),
            total_received_bytes: 42,
            ..Default::default()
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["totalReceivedBytes"], 42);
        assert!(json.get("latenciesByURL").is_none());
    }
}
