//! kubeload-server coordinates groups of benchmark runners inside a
//! Kubernetes cluster.
#![deny(missing_docs)]
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kube::Client;
use kubeload_common::telemetry;
use kubeload_server::api::Server;
use kubeload_server::group::{spec_from_uri, GroupHandler};
use kubeload_server::summary;
use tracing::info;

/// Well-known port the coordinator listens on inside the cluster.
const SERVER_PORT: u16 = 8080;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, env = "SERVER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

/// Available Subcommands
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the in-cluster coordinator
    Daemon(DaemonOpts),
    /// Fetch the merged summary from a coordinator pod
    Summary(SummaryOpts),
}

#[derive(clap::Args, Debug)]
struct DaemonOpts {
    /// Namespace hosting the runner groups.
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Image for the runner pods.
    #[arg(long)]
    runner_image: String,

    /// Listen addresses. At least one must be non-loopback, it is
    /// published to the runners for uploads.
    #[arg(long = "address", default_value = "0.0.0.0:8080")]
    addresses: Vec<String>,

    /// Directory for uploaded runner reports.
    #[arg(long, default_value = "/data/kubeload")]
    data_dir: PathBuf,

    /// Runner group spec URIs (file:///path or
    /// configmap://name?namespace=ns&key=spec).
    #[arg(long = "runner-group", required = true)]
    runner_groups: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct SummaryOpts {
    /// Path to the kubeconfig file. Defaults to the ambient configuration.
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Namespace of the coordinator pod.
    #[arg(long, default_value = "kubeload")]
    namespace: String,

    /// Name of the coordinator pod.
    #[arg(long, default_value = "kubeload-server")]
    pod: String,

    /// Coordinator port inside the cluster.
    #[arg(long, default_value_t = SERVER_PORT)]
    port: u16,

    /// Block until every runner group finished.
    #[arg(long)]
    wait: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    telemetry::init_tracing(args.otlp_endpoint.clone())?;

    let res = match args.command {
        Command::Daemon(opts) => daemon(opts).await,
        Command::Summary(opts) => {
            let report = summary::fetch(
                opts.kubeconfig.as_deref(),
                &opts.namespace,
                &opts.pod,
                opts.port,
                opts.wait,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    };

    telemetry::shutdown();
    res
}

async fn daemon(opts: DaemonOpts) -> Result<()> {
    let client = Client::try_default().await?;

    let mut groups = Vec::with_capacity(opts.runner_groups.len());
    for (idx, uri) in opts.runner_groups.iter().enumerate() {
        let spec = spec_from_uri(client.clone(), uri).await?;
        let name = format!("kubeload-rg-{idx}");
        info!(group = name, uri, count = spec.count, "loaded runner group spec");
        groups.push(GroupHandler::new(
            client.clone(),
            &opts.namespace,
            &name,
            spec,
            &opts.runner_image,
        )?);
    }

    let server = Server::new(&opts.data_dir, &opts.addresses, groups).await?;
    server.run().await
}
