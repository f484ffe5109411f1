//! The runner-group coordinator server.
//!
//! One server pod deploys every configured runner group, receives each
//! runner's report over HTTP, and serves the merged summary once all groups
//! finished.
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::extract::{Path as UrlPath, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use kubeload_common::report::{
    build_percentile_latencies, format_duration, parse_duration, HttpError, RunnerReport,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::group::GroupHandler;
use crate::store::{Store, StoreError};

/// The coordinator server.
pub struct Server {
    store: Store,
    groups: Arc<Vec<GroupHandler>>,
    listeners: Vec<TcpListener>,
    report_tx: watch::Sender<Option<Arc<RunnerReport>>>,
}

impl Server {
    /// Bind all listen addresses and prepare the local store.
    ///
    /// At least one address must be non-loopback: it is the address the
    /// runners upload their reports to.
    pub async fn new(data_dir: &Path, addrs: &[String], groups: Vec<GroupHandler>) -> Result<Self> {
        let store = Store::new(data_dir).await?;

        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to listen on {addr}"))?;
            listeners.push(listener);
        }

        let (report_tx, _) = watch::channel(None);
        Ok(Self {
            store,
            groups: Arc::new(groups),
            listeners,
            report_tx,
        })
    }

    /// Deploy the groups and serve the coordinator API until failure.
    pub async fn run(self) -> Result<()> {
        let upload_url = format!(
            "http://{}/v1/runnergroups/$(POD_NAME)/result",
            self.first_non_local_addr()?
        );

        info!(upload_url, groups = self.groups.len(), "deploying runner groups");
        futures::future::try_join_all(
            self.groups
                .iter()
                .map(|group| group.deploy(&upload_url)),
        )
        .await
        .context("failed to deploy runner groups")?;

        // Once every group reaches a terminal state the uploaded reports
        // are merged and the summary gate opens.
        tokio::spawn(wait_for_groups(
            self.groups.clone(),
            self.store.clone(),
            self.report_tx.clone(),
        ));

        let state = AppState {
            store: self.store,
            groups: self.groups,
            report: self.report_tx.subscribe(),
        };
        let app = router(state);

        let mut serves = tokio::task::JoinSet::new();
        for listener in self.listeners {
            let app = app.clone();
            serves.spawn(async move { axum::serve(listener, app).await });
        }
        while let Some(res) = serves.join_next().await {
            res?.context("http server failed")?;
        }
        Ok(())
    }

    fn first_non_local_addr(&self) -> Result<SocketAddr> {
        for listener in &self.listeners {
            let addr = listener.local_addr()?;
            if !addr.ip().is_loopback() {
                return Ok(addr);
            }
        }
        Err(anyhow!("there is no non-local listen address"))
    }
}

#[derive(Clone)]
struct AppState {
    store: Store,
    groups: Arc<Vec<GroupHandler>>,
    report: watch::Receiver<Option<Arc<RunnerReport>>>,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/runnergroups", get(list_runner_groups))
        .route("/v1/runnergroups/summary", get(get_summary))
        .route("/v1/runnergroups/:runner_name/result", post(post_runner_result))
        .with_state(state)
}

async fn wait_for_groups(
    groups: Arc<Vec<GroupHandler>>,
    store: Store,
    report_tx: watch::Sender<Option<Arc<RunnerReport>>>,
) {
    for group in groups.iter() {
        if let Err(err) = group.wait().await {
            error!(group = group.name(), %err, "failed to wait for runner group");
        }
    }

    let report = build_summary(&store, &groups).await;
    info!(total = report.total, "runner groups finished, summary ready");
    report_tx.send_replace(Some(Arc::new(report)));
}

/// Merge every committed runner report into one summary.
///
/// Runners that never uploaded a report are skipped with a warning; the
/// summary covers everything that arrived.
async fn build_summary(store: &Store, groups: &[GroupHandler]) -> RunnerReport {
    let mut reports = Vec::new();
    for group in groups {
        let pods = match group.pods().await {
            Ok(pods) => pods,
            Err(err) => {
                warn!(group = group.name(), %err, "failed to list runners");
                continue;
            }
        };

        for pod in pods {
            let Some(name) = pod.metadata.name else { continue };
            let raw = match read_blob(store, &name).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(runner = name, %err, "failed to read report");
                    continue;
                }
            };
            match serde_json::from_slice::<RunnerReport>(&raw) {
                Ok(report) => reports.push(report),
                Err(err) => warn!(runner = name, %err, "failed to unmarshal report"),
            }
        }
    }
    merge_reports(reports)
}

/// Merge per-runner reports: durations take the maximum (the slowest runner
/// bounds the experiment), bytes and error counts sum, latencies pool into
/// one distribution.
pub fn merge_reports(reports: Vec<RunnerReport>) -> RunnerReport {
    let mut total_bytes = 0i64;
    let mut max_duration = Duration::ZERO;
    let mut error_stats: BTreeMap<String, i64> = BTreeMap::new();
    let mut latencies_by_url: BTreeMap<String, Vec<f64>> = BTreeMap::new();

    for report in reports {
        total_bytes += report.total_received_bytes;

        match parse_duration(&report.duration) {
            Ok(duration) => max_duration = max_duration.max(duration),
            Err(err) => warn!(duration = report.duration, %err, "failed to parse duration"),
        }

        for (key, count) in report.error_stats {
            *error_stats.entry(key).or_insert(0) += count;
        }
        for (url, latencies) in report.latencies_by_url {
            latencies_by_url.entry(url).or_default().extend(latencies);
        }
    }

    let pooled: Vec<f64> = latencies_by_url.values().flatten().copied().collect();
    RunnerReport {
        total: pooled.len(),
        duration: format_duration(max_duration),
        error_stats,
        total_received_bytes: total_bytes,
        percentile_latencies: build_percentile_latencies(pooled),
        percentile_latencies_by_url: latencies_by_url
            .into_iter()
            .map(|(url, latencies)| (url, build_percentile_latencies(latencies)))
            .collect(),
        ..Default::default()
    }
}

async fn read_blob(store: &Store, reference: &str) -> Result<Vec<u8>, StoreError> {
    let reader = store.open_reader(reference).await?;
    reader.read_to_end().await
}

// GET /v1/runnergroups
async fn list_runner_groups(State(state): State<AppState>) -> Response {
    let mut res = Vec::with_capacity(state.groups.len());
    for group in state.groups.iter() {
        res.push(group.info().await);
    }
    Json(res).into_response()
}

// GET /v1/runnergroups/summary[?wait]
async fn get_summary(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    let wait = query
        .as_deref()
        .map(|q| q.split('&').any(|p| p == "wait" || p.starts_with("wait=")))
        .unwrap_or(false);

    if let Some(report) = state.report.borrow().as_ref() {
        return Json(report.as_ref().clone()).into_response();
    }
    if !wait {
        return error_response(StatusCode::NOT_FOUND, "summary is not ready");
    }

    // Block until the summary gate opens. A disconnecting client drops
    // this future, so there is nobody left to answer.
    let mut report_rx = state.report.clone();
    let result = match report_rx.wait_for(|report| report.is_some()).await {
        Ok(report) => Json(report.as_ref().expect("gate only opens with a report").as_ref().clone())
            .into_response(),
        Err(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "summary publisher went away",
        ),
    };
    result
}

// POST /v1/runnergroups/{runner_name}/result
async fn post_runner_result(
    State(state): State<AppState>,
    UrlPath(runner_name): UrlPath<String>,
    body: axum::body::Body,
) -> Response {
    let mut found = false;
    for group in state.groups.iter() {
        match group.is_controlled(&runner_name).await {
            Ok(controlled) => {
                if controlled {
                    found = true;
                    break;
                }
            }
            Err(err) => {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
            }
        }
    }
    if !found {
        return error_response(
            StatusCode::NOT_FOUND,
            &format!("no such runner {runner_name}"),
        );
    }

    let mut writer = match state.store.open_writer().await {
        Ok(writer) => writer,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    };

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = writer.close().await;
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
            }
        };
        if let Err(err) = writer.write_all(&chunk).await {
            let _ = writer.close().await;
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
        }
    }

    match writer.commit(&runner_name).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err @ StoreError::AlreadyExists(_)) => {
            error_response(StatusCode::CONFLICT, &err.to_string())
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

fn error_response(code: StatusCode, message: &str) -> Response {
    (
        code,
        Json(HttpError {
            error: message.to_owned(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http::Request;
    use http_body_util::BodyExt;
    use kubeload_common::group::RunnerGroupSpec;
    use kubeload_common::profile::{LoadProfile, LoadProfileSpec, RequestGet, WeightedRequest};
    use tower::ServiceExt;

    use super::*;

    fn report(duration: &str, bytes: i64, latencies: &[f64]) -> RunnerReport {
        RunnerReport {
            total: latencies.len(),
            duration: duration.to_owned(),
            total_received_bytes: bytes,
            latencies_by_url: BTreeMap::from_iter(vec![(
                "https://host/api/v1/pods".to_owned(),
                latencies.to_vec(),
            )]),
            ..Default::default()
        }
    }

    #[test]
    fn merge_takes_max_duration_and_sums_the_rest() {
        let merged = merge_reports(vec![
            report("10s", 1000, &[0.1, 0.2]),
            report("12s", 2000, &[0.3, 0.4, 0.5]),
        ]);

        assert_eq!(merged.duration, "12s");
        assert_eq!(merged.total_received_bytes, 3000);
        assert_eq!(merged.total, 5);
        let p100 = merged.percentile_latencies.last().unwrap();
        assert_eq!(*p100, (1.0, 0.5));
    }

    #[test]
    fn merge_pools_error_stats() {
        let mut a = report("1s", 0, &[]);
        a.error_stats = BTreeMap::from_iter(vec![("http/429".to_owned(), 2)]);
        let mut b = report("2s", 0, &[]);
        b.error_stats = BTreeMap::from_iter(vec![
            ("http/429".to_owned(), 1),
            ("connection/connection refused".to_owned(), 4),
        ]);

        let merged = merge_reports(vec![a, b]);
        assert_eq!(merged.error_stats["http/429"], 3);
        assert_eq!(merged.error_stats["connection/connection refused"], 4);
    }

    #[test]
    fn merge_of_nothing_is_empty() {
        let merged = merge_reports(Vec::new());
        assert_eq!(merged.total, 0);
        assert_eq!(merged.duration, "0s");
        assert!(merged.percentile_latencies.is_empty());
    }

    fn group_spec() -> RunnerGroupSpec {
        RunnerGroupSpec {
            count: 1,
            load_profile: LoadProfile {
                version: 1,
                spec: LoadProfileSpec {
                    total: 1,
                    conns: 1,
                    requests: vec![WeightedRequest {
                        shares: 1,
                        stale_get: Some(RequestGet {
                            version: "v1".into(),
                            resource: "pods".into(),
                            namespace: "default".into(),
                            name: "x".into(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn test_state(
        groups: Vec<GroupHandler>,
    ) -> (
        tempfile::TempDir,
        AppState,
        watch::Sender<Option<Arc<RunnerReport>>>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).await.unwrap();
        let (report_tx, report) = watch::channel(None);
        (
            dir,
            AppState {
                store,
                groups: Arc::new(groups),
                report,
            },
            report_tx,
        )
    }

    fn mock_group(name: &str) -> GroupHandler {
        let (mock_service, handle) = tower_test::mock::pair::<
            http::Request<kube::client::Body>,
            http::Response<kube::client::Body>,
        >();
        // Answer every pod list with one pod named `<group>-0`.
        let pod_name = format!("{name}-0");
        tokio::spawn(async move {
            let mut handle = handle;
            while let Some((_request, send)) = handle.next_request().await {
                let pod_list = serde_json::json!({
                    "apiVersion": "v1",
                    "kind": "PodList",
                    "metadata": {"resourceVersion": "1"},
                    "items": [
                        {"metadata": {"name": pod_name, "namespace": "kubeload"}}
                    ]
                });
                send.send_response(
                    http::Response::builder()
                        .status(200)
                        .header("content-type", "application/json")
                        .body(kube::client::Body::from(
                            serde_json::to_vec(&pod_list).unwrap(),
                        ))
                        .unwrap(),
                );
            }
        });

        let client = kube::Client::new(mock_service, "kubeload");
        GroupHandler::new(client, "kubeload", name, group_spec(), "kubeload/runner:latest")
            .unwrap()
    }

    #[tokio::test]
    async fn summary_is_404_until_ready() {
        let (_dir, state, _report_tx) = test_state(Vec::new()).await;
        let app = router(state);

        let resp = app
            .oneshot(
                Request::get("/v1/runnergroups/summary")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let err: HttpError = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.error, "summary is not ready");
    }

    #[tokio::test]
    async fn summary_waits_for_the_gate() {
        let (_dir, state, report_tx) = test_state(Vec::new()).await;
        let app = router(state);

        let request = app.oneshot(
            Request::get("/v1/runnergroups/summary?wait")
                .body(Body::empty())
                .unwrap(),
        );
        let publish = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            report_tx.send_replace(Some(Arc::new(RunnerReport {
                total: 7,
                duration: "1s".to_owned(),
                ..Default::default()
            })));
        };

        let (resp, ()) = tokio::join!(request, publish);
        let resp = resp.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let report: RunnerReport = serde_json::from_slice(&body).unwrap();
        assert_eq!(report.total, 7);
    }

    #[tokio::test]
    async fn upload_unknown_runner_is_404() {
        let (_dir, state, _report_tx) = test_state(vec![mock_group("demo")]).await;
        let app = router(state);

        // "other-0" does not carry the group's name prefix, so the lookup
        // never reaches the apiserver.
        let resp = app
            .oneshot(
                Request::post("/v1/runnergroups/other-0/result")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_commits_once_then_conflicts() {
        let (_dir, state, _report_tx) = test_state(vec![mock_group("demo")]).await;
        let app = router(state);

        let payload = serde_json::to_vec(&report("3s", 10, &[0.1])).unwrap();
        let resp = app
            .clone()
            .oneshot(
                Request::post("/v1/runnergroups/demo-0/result")
                    .body(Body::from(payload.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = app
            .oneshot(
                Request::post("/v1/runnergroups/demo-0/result")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn uploaded_reports_merge_into_the_summary() {
        let (_dir, state, _report_tx) = test_state(vec![mock_group("demo")]).await;

        let payload = serde_json::to_vec(&report("3s", 42, &[0.1, 0.2])).unwrap();
        let app = router(state.clone());
        let resp = app
            .oneshot(
                Request::post("/v1/runnergroups/demo-0/result")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let summary = build_summary(&state.store, &state.groups).await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.total_received_bytes, 42);
        assert_eq!(summary.duration, "3s");
    }
}
