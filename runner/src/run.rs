//! The `run` subcommand: execute one load profile and report the result.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use kubeload_common::profile::{ContentType, LoadProfile};
use kubeload_common::report::{HttpError, RunnerReport};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{self, ClientOptions};
use crate::schedule;

/// Options for the run command.
#[derive(Args, Debug)]
pub struct Opts {
    /// Path to the kubeconfig file.
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Path to the load profile.
    #[arg(long)]
    config: PathBuf,

    /// Maximum requests per second (zero means no limit). Overrides the
    /// profile.
    #[arg(long)]
    rate: Option<f64>,

    /// Total number of requests. Overrides the profile.
    #[arg(long)]
    total: Option<usize>,

    /// Total number of long connections. Overrides the profile.
    #[arg(long)]
    conns: Option<usize>,

    /// Total number of workers. Overrides the profile.
    #[arg(long)]
    client: Option<usize>,

    /// Content type (json or protobuf). Overrides the profile.
    #[arg(long)]
    content_type: Option<ContentType>,

    /// User agent for every request.
    #[arg(long)]
    user_agent: Option<String>,

    /// Restrict clients to HTTP/1.1.
    #[arg(long)]
    disable_http2: bool,

    /// Retry budget for 429 responses (<= 0 means no retry). Overrides the
    /// profile.
    #[arg(long)]
    max_retries: Option<i32>,

    /// Write the report to this file instead of stdout.
    #[arg(long)]
    result: Option<PathBuf>,

    /// Include raw latencies and errors in the report.
    #[arg(long)]
    raw_data: bool,

    /// Upload the report to this URL when the run finishes. Deployed
    /// runners receive it from the coordinator.
    #[arg(long, env = "TARGET_URL")]
    upload_url: Option<String>,
}

/// Load the profile, drive the scheduler, and emit the report.
pub async fn run(opts: Opts) -> Result<()> {
    let profile = load_profile(&opts)?;
    let kubeconfig = opts
        .kubeconfig
        .clone()
        .or_else(default_kubeconfig)
        .ok_or_else(|| anyhow!("no kubeconfig given and no home directory found"))?;

    let clients = client::new_clients(
        &kubeconfig,
        profile.spec.conns,
        ClientOptions {
            user_agent: opts.user_agent.clone(),
            content_type: profile.spec.content_type,
            disable_http2: profile.spec.disable_http2,
            max_retries: profile.spec.max_retries,
            timeout: client::DEFAULT_TIMEOUT,
        },
    )
    .await?;

    // Ctrl-C stops the run; whatever was observed so far is still reported.
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping the run");
                cancel.cancel();
            }
        }
    });

    let result = schedule::schedule(&profile.spec, clients, cancel).await?;
    // The uploaded report always carries the raw observations: the
    // coordinator needs them to pool latencies across runners.
    let full = RunnerReport::build(result.stats, result.duration, result.total, true);
    let report = if opts.raw_data {
        full.clone()
    } else {
        RunnerReport {
            errors: Vec::new(),
            latencies_by_url: Default::default(),
            ..full.clone()
        }
    };

    let rendered = serde_json::to_string_pretty(&report)?;
    match &opts.result {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to ensure result dir {}", dir.display()))?;
            }
            std::fs::write(path, &rendered)
                .with_context(|| format!("failed to write result to {}", path.display()))?;
        }
        None => println!("{rendered}"),
    }

    if let Some(url) = &opts.upload_url {
        upload_report(url, &full).await?;
    }
    Ok(())
}

fn load_profile(opts: &Opts) -> Result<LoadProfile> {
    let raw = std::fs::read_to_string(&opts.config)
        .with_context(|| format!("failed to read {}", opts.config.display()))?;
    let mut profile: LoadProfile = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse {}", opts.config.display()))?;

    if let Some(rate) = opts.rate {
        profile.spec.rate = rate;
    }
    if let Some(total) = opts.total {
        profile.spec.total = total;
    }
    if let Some(conns) = opts.conns {
        profile.spec.conns = conns;
    }
    if let Some(client) = opts.client {
        profile.spec.client = client;
    }
    if let Some(content_type) = opts.content_type {
        profile.spec.content_type = content_type;
    }
    if opts.disable_http2 {
        profile.spec.disable_http2 = true;
    }
    if let Some(max_retries) = opts.max_retries {
        profile.spec.max_retries = max_retries;
    }

    profile.validate()?;
    Ok(profile)
}

fn default_kubeconfig() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| Path::new(&home).join(".kube").join("config"))
}

// The coordinator may not be reachable the instant a runner finishes, so a
// few connection failures are retried before giving up.
async fn upload_report(url: &str, report: &RunnerReport) -> Result<()> {
    const ATTEMPTS: u32 = 5;

    let client = reqwest::Client::new();
    let body = serde_json::to_vec(report)?;
    for attempt in 1..=ATTEMPTS {
        let resp = client.post(url).body(body.clone()).send().await;
        match resp {
            Ok(resp) if resp.status() == reqwest::StatusCode::CREATED => {
                info!(url, "uploaded report");
                return Ok(());
            }
            Ok(resp) => {
                let status = resp.status();
                let message = resp
                    .json::<HttpError>()
                    .await
                    .map(|e| e.error)
                    .unwrap_or_default();
                return Err(anyhow!("upload rejected with {status}: {message}"));
            }
            Err(err) if attempt < ATTEMPTS => {
                warn!(%err, attempt, "upload failed, retrying");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            Err(err) => return Err(err).context("failed to upload report"),
        }
    }
    unreachable!("upload loop either returns or errors");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_profile(dir: &Path, doc: &str) -> PathBuf {
        let path = dir.join("profile.yaml");
        std::fs::write(&path, doc).unwrap();
        path
    }

    fn opts(config: PathBuf) -> Opts {
        Opts {
            kubeconfig: None,
            config,
            rate: None,
            total: None,
            conns: None,
            client: None,
            content_type: None,
            user_agent: None,
            disable_http2: false,
            max_retries: None,
            result: None,
            raw_data: false,
            upload_url: None,
        }
    }

    #[test]
    fn flag_overrides_apply_before_validation() {
        let dir = std::env::temp_dir().join("kubeload-run-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_profile(
            &dir,
            r#"
version: 1
spec:
  rate: 10
  total: 100
  conns: 1
  requests:
  - shares: 1
    staleGet:
      version: v1
      resource: pods
      namespace: default
      name: x
"#,
        );

        let mut opts = opts(path);
        opts.rate = Some(0.0);
        opts.total = Some(5);
        opts.conns = Some(2);
        opts.max_retries = Some(3);

        let profile = load_profile(&opts).unwrap();
        assert_eq!(profile.spec.rate, 0.0);
        assert_eq!(profile.spec.total, 5);
        assert_eq!(profile.spec.conns, 2);
        assert_eq!(profile.spec.max_retries, 3);
    }

    #[test]
    fn invalid_profile_is_rejected() {
        let dir = std::env::temp_dir().join("kubeload-run-test-invalid");
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_profile(
            &dir,
            r#"
version: 1
spec:
  total: 100
  conns: 0
  requests:
  - shares: 1
    staleGet:
      version: v1
      resource: pods
      namespace: default
      name: x
"#,
        );

        assert!(load_profile(&opts(path)).is_err());
    }
}
