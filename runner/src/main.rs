//! kubeload-runner drives benchmark traffic against a kube-apiserver.
#![deny(missing_docs)]
use anyhow::Result;
use clap::{Parser, Subcommand};
use kubeload_common::telemetry;
use kubeload_runner::run;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, env = "RUNNER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

/// Available Subcommands
#[derive(Subcommand, Debug)]
enum Command {
    /// Run a benchmark against the kube-apiserver
    Run(run::Opts),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    telemetry::init_tracing(args.otlp_endpoint.clone())?;

    info!(?args.command, "starting runner");
    let res = match args.command {
        Command::Run(opts) => run::run(opts).await,
    };

    // Flush traces before shutdown
    telemetry::shutdown();
    res
}
