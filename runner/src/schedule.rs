//! Request scheduler: drives worker tasks that pull from the weighted
//! stream, gate on the rate limiter, execute against the client pool, and
//! feed the response metric.
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::chrono::Utc;
use kubeload_common::profile::LoadProfileSpec;
use kubeload_common::report::ResponseStats;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::LoadClient;
use crate::limit::RateLimiter;
use crate::metrics::{is_http2_stream_no_error, RequestError, ResponseMetric};
use crate::random::{RequestStream, StreamError, WeightedRandomRequests};

/// Outcome of one scheduler invocation.
#[derive(Debug)]
pub struct RunResult {
    /// Everything the metric sink observed.
    pub stats: ResponseStats,
    /// Wall clock of the whole run.
    pub duration: Duration,
    /// Number of requests the profile asked for. On cancellation the
    /// observed counts may be smaller.
    pub total: usize,
}

/// Issue `spec.total` weighted-random requests through `clients`.
///
/// Cancellation stops the stream and the workers promptly; everything
/// observed up to that point is still returned.
pub async fn schedule(
    spec: &LoadProfileSpec,
    clients: Vec<LoadClient>,
    cancel: CancellationToken,
) -> Result<RunResult, StreamError> {
    let requests = WeightedRandomRequests::new(spec)?;

    let workers = if spec.client > 0 { spec.client } else { spec.conns };
    info!(
        clients = workers,
        connections = clients.len(),
        rate = spec.rate,
        total = spec.total,
        http2 = !spec.disable_http2,
        content_type = ?spec.content_type,
        "scheduling load"
    );

    let limiter = Arc::new(RateLimiter::new(spec.rate));
    let metric = Arc::new(ResponseMetric::new());
    let clients = Arc::new(clients);
    let stream = requests.run(spec.total);

    let start = Instant::now();
    let mut tasks = JoinSet::new();
    for worker in 0..workers {
        // Workers beyond the pool size share connections round-robin.
        let client = worker % clients.len();
        let worker = Worker {
            clients: clients.clone(),
            client,
            stream: stream.clone(),
            limiter: limiter.clone(),
            metric: metric.clone(),
            cancel: cancel.clone(),
        };
        tasks.spawn(worker.run());
    }
    while tasks.join_next().await.is_some() {}
    requests.stop();

    let duration = start.elapsed();
    Ok(RunResult {
        stats: metric.gather(),
        duration,
        total: spec.total,
    })
}

struct Worker {
    clients: Arc<Vec<LoadClient>>,
    client: usize,
    stream: RequestStream,
    limiter: Arc<RateLimiter>,
    metric: Arc<ResponseMetric>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let client = &self.clients[self.client];
        loop {
            let builder = tokio::select! {
                _ = self.cancel.cancelled() => return,
                next = self.stream.recv() => match next {
                    Some(builder) => builder,
                    None => return,
                },
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.limiter.acquire() => {}
            }

            let request = builder.build(client);
            debug!(method = builder.method(), url = %request.url(), "request");
            // Dropping the execute future aborts the in-flight request.
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.execute(client, request) => {}
            }
        }
    }

    async fn execute(&self, client: &LoadClient, request: reqwest::Request) {
        let url = request.url().clone();
        let start = Instant::now();

        let response = match client.send(request).await {
            Ok(response) => response,
            Err(err) => {
                let latency = start.elapsed().as_secs_f64();
                self.metric.observe_received_bytes(0);
                self.metric
                    .observe_failure(Utc::now(), latency, &RequestError::Transport(err));
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            // Drain the error body so the connection can be reused.
            let _ = response.bytes().await;
            let latency = start.elapsed().as_secs_f64();
            self.metric.observe_received_bytes(0);
            self.metric
                .observe_failure(Utc::now(), latency, &RequestError::Status(status));
            return;
        }

        let mut bytes: i64 = 0;
        let mut failure: Option<reqwest::Error> = None;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => bytes += chunk.len() as i64,
                Err(err) => {
                    // A RST_STREAM(NO_ERROR) after a complete response is a
                    // legal way for the server to close the stream; the
                    // response must not be discarded.
                    if !is_http2_stream_no_error(&err) {
                        failure = Some(err);
                    }
                    break;
                }
            }
        }

        let latency = start.elapsed().as_secs_f64();
        self.metric.observe_received_bytes(bytes);
        match failure {
            Some(err) => {
                self.metric
                    .observe_failure(Utc::now(), latency, &RequestError::Transport(err));
            }
            None => self.metric.observe_latency(url.as_str(), latency),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use kubeload_common::profile::{ContentType, RequestGet, WeightedRequest};
    use kubeload_common::report::ResponseErrorKind;
    use url::Url;

    use crate::client::{new_anonymous_clients, ClientOptions};

    use super::*;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn stale_get_spec(total: usize, rate: f64, name: &str) -> LoadProfileSpec {
        LoadProfileSpec {
            rate,
            total,
            conns: 1,
            client: 1,
            requests: vec![WeightedRequest {
                shares: 1,
                stale_get: Some(RequestGet {
                    version: "v1".into(),
                    resource: "pods".into(),
                    namespace: "default".into(),
                    name: name.into(),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn clients_for(addr: SocketAddr, conns: usize, opts: ClientOptions) -> Vec<LoadClient> {
        let base = Url::parse(&format!("http://{addr}")).unwrap();
        new_anonymous_clients(base, conns, opts).unwrap()
    }

    #[tokio::test]
    async fn single_request_records_latency_and_bytes() {
        let app = Router::new().route(
            "/api/v1/namespaces/default/pods/x",
            get(|| async { vec![7u8; 42] }),
        );
        let addr = serve(app).await;

        let spec = stale_get_spec(1, 0.0, "x");
        let clients = clients_for(addr, 1, ClientOptions::default());
        let result = schedule(&spec, clients, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.total, 1);
        assert!(result.stats.errors.is_empty());
        assert_eq!(result.stats.total_received_bytes, 42);
        let url = format!("http://{addr}/api/v1/namespaces/default/pods/x?resourceVersion=0");
        assert_eq!(result.stats.latencies_by_url[&url].len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_bounds_the_duration() {
        let app = Router::new().route(
            "/api/v1/namespaces/default/pods/x",
            get(|| async { "ok" }),
        );
        let addr = serve(app).await;

        let spec = stale_get_spec(10, 5.0, "x");
        let clients = clients_for(addr, 1, ClientOptions::default());
        let result = schedule(&spec, clients, CancellationToken::new())
            .await
            .unwrap();

        // Ten requests at 5/s with one free burst token.
        assert!(
            result.duration >= Duration::from_millis(1800),
            "expected >= 1.8s, got {:?}",
            result.duration
        );
    }

    #[tokio::test]
    async fn retries_on_429_with_retry_after() {
        #[derive(Clone, Default)]
        struct Hits(Arc<AtomicUsize>);

        async fn throttled(State(hits): State<Hits>) -> (StatusCode, HeaderMap, &'static str) {
            let n = hits.0.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                let mut headers = HeaderMap::new();
                headers.insert("Retry-After", "0".parse().unwrap());
                (StatusCode::TOO_MANY_REQUESTS, headers, "slow down")
            } else {
                (StatusCode::OK, HeaderMap::new(), "ok")
            }
        }

        let hits = Hits::default();
        let app = Router::new()
            .route("/api/v1/namespaces/default/pods/x", get(throttled))
            .with_state(hits.clone());
        let addr = serve(app).await;

        let spec = stale_get_spec(1, 0.0, "x");
        let opts = ClientOptions {
            max_retries: 3,
            ..Default::default()
        };
        let result = schedule(&spec, clients_for(addr, 1, opts), CancellationToken::new())
            .await
            .unwrap();

        assert!(result.stats.errors.is_empty());
        assert_eq!(hits.0.load(Ordering::SeqCst), 3);
        let total: usize = result.stats.latencies_by_url.values().map(Vec::len).sum();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn no_retries_records_http_429() {
        async fn throttled() -> (StatusCode, HeaderMap, &'static str) {
            let mut headers = HeaderMap::new();
            headers.insert("Retry-After", "0".parse().unwrap());
            (StatusCode::TOO_MANY_REQUESTS, headers, "slow down")
        }

        let app = Router::new().route("/api/v1/namespaces/default/pods/x", get(throttled));
        let addr = serve(app).await;

        let spec = stale_get_spec(1, 0.0, "x");
        let result = schedule(
            &spec,
            clients_for(addr, 1, ClientOptions::default()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(result.stats.latencies_by_url.is_empty());
        assert_eq!(result.stats.errors.len(), 1);
        assert_eq!(result.stats.errors[0].kind, ResponseErrorKind::Http);
        assert_eq!(result.stats.errors[0].code, Some(429));
    }

    #[tokio::test]
    async fn content_type_selects_accept_header() {
        async fn echo_accept(headers: HeaderMap) -> String {
            headers
                .get("accept")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_owned()
        }

        let app = Router::new().route("/api/v1/namespaces/default/pods/x", get(echo_accept));
        let addr = serve(app).await;

        let spec = stale_get_spec(1, 0.0, "x");
        let opts = ClientOptions {
            content_type: ContentType::Protobuf,
            ..Default::default()
        };
        let result = schedule(&spec, clients_for(addr, 1, opts), CancellationToken::new())
            .await
            .unwrap();

        // "application/vnd.kubernetes.protobuf" is 35 bytes.
        assert_eq!(result.stats.total_received_bytes, 35);
    }

    #[tokio::test]
    async fn cancellation_returns_partial_result() {
        let app = Router::new().route(
            "/api/v1/namespaces/default/pods/x",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                "ok"
            }),
        );
        let addr = serve(app).await;

        let spec = stale_get_spec(1_000_000, 0.0, "x");
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            let clients = clients_for(addr, 1, ClientOptions::default());
            tokio::spawn(async move { schedule(&spec, clients, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let result = handle.await.unwrap().unwrap();

        let observed: usize = result.stats.latencies_by_url.values().map(Vec::len).sum();
        assert!(observed > 0, "some requests should have completed");
        assert!(observed < 1_000_000);
    }
}
