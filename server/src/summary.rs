//! Fetch the merged summary from a running coordinator pod.
use std::path::Path;

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use kubeload_common::report::{HttpError, RunnerReport};

use crate::portforward::PodPortForwarder;

/// Port-forward to the coordinator pod and fetch the merged report.
///
/// With `wait` the request blocks until every runner group finished;
/// without it a summary that is not ready yet yields an error.
pub async fn fetch(
    kubeconfig: Option<&Path>,
    namespace: &str,
    pod_name: &str,
    port: u16,
    wait: bool,
) -> Result<RunnerReport> {
    let client = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await?;
            Client::try_from(config)?
        }
        None => Client::try_default().await?,
    };

    let forwarder = PodPortForwarder::start(client, namespace, pod_name, port)
        .await
        .context("failed to start pod port forward")?;

    let mut url = format!(
        "http://{}/v1/runnergroups/summary",
        forwarder.local_addr()
    );
    if wait {
        url.push_str("?wait");
    }

    let resp = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to access {url} by port forward"))?;
    let status = resp.status();
    let body = resp.bytes().await.context("failed to read response")?;
    forwarder.stop();

    if !status.is_success() {
        let err: HttpError = serde_json::from_slice(&body)
            .with_context(|| format!("summary request failed with {status}"))?;
        return Err(err.into());
    }

    serde_json::from_slice(&body).context("failed to unmarshal summary report")
}
