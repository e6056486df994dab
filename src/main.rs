use std::error::Error as _;
use std::fmt::Write;
use std::process::ExitCode;

use clap::Parser;
use tracing::*;
use tracing_subscriber::EnvFilter;

use crate::api::GitLab;
use crate::bootstrap::{Bootstrap, Registration};
use crate::cluster::KubeCluster;
use crate::config::Cli;
use crate::error::{Error, Result};
use crate::retry::RetryConfig;

mod api;
mod bootstrap;
mod cluster;
mod config;
mod context;
mod error;
mod registrar;
mod retry;

async fn run(cli: Cli) -> Result<Registration> {
    let gitlab_options = cli.gitlab_options()?;
    let kube = config::load_kube_context(&cli.kube).await?;
    let target = gitlab_options.target()?;

    let gitlab = GitLab::new(&gitlab_options.token, gitlab_options.url.as_deref()).map_err(
        |source| Error::GitLabUnreachable {
            target: target.clone(),
            source,
        },
    )?;

    let bootstrap = Bootstrap {
        target,
        identity: kube.identity,
        namespace: cli.kube.namespace.clone(),
        retry: RetryConfig::with_max_attempts(cli.token_attempts),
    };
    debug!(?bootstrap.target, namespace = %bootstrap.namespace, "Starting bootstrap");

    bootstrap.run(&KubeCluster::new(kube.client), &gitlab).await
}

fn error_chain(err: &Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(src) = source {
        let _ = write!(msg, ": {src}");
        source = src.source();
    }
    msg
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli).await {
        Ok(registration) => {
            println!(
                "Cluster successfully added to {}!",
                registration.target.kind()
            );
            println!(
                "To finish up visit: {} and install Helm and Runner.",
                registration.cluster.url()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {}", error_chain(&err));
            ExitCode::FAILURE
        }
    }
}
