//! dekube
//!
//! Convert a directory of rendered Kubernetes manifests into a Docker
//! Compose project: a compose file, a Caddyfile, and a persistent project
//! configuration.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dekube_cli::Cli;

fn main() -> ExitCode {
    // Initialize tracing; all diagnostics go to stderr, outputs to files
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    match cli.run() {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e}");
            ExitCode::from(1)
        }
    }
}
