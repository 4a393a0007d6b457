//! Sandbox allocator - hands out one container sandbox per user over HTTP.
//!
//! Usage:
//!   sandbox-allocator serve [--port 8080] [--backend remote|memory]

mod backend;
mod config;
mod error;
mod http_server;
mod manager;
mod state;

use std::process::exit;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::backend::{MemoryBackend, RemoteBackend, SandboxBackend};
use crate::config::Config;
use crate::error::BackendError;
use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "sandbox-allocator")]
#[command(about = "Per-user container sandbox allocator with HTTP API")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Where sandboxes are provisioned
        #[arg(long, value_enum, default_value_t = BackendKind::Remote)]
        backend: BackendKind,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// Container-group orchestration API
    Remote,
    /// In-process fake, for local development
    Memory,
}

fn build_backend(kind: BackendKind, config: &Config) -> Result<Arc<dyn SandboxBackend>, BackendError> {
    let backend: Arc<dyn SandboxBackend> = match kind {
        BackendKind::Remote => Arc::new(
            RemoteBackend::new(
                config.target.clone(),
                config.endpoint.clone(),
                config.request_timeout,
            )?
            .with_polling(config.poll_interval, config.max_polls),
        ),
        BackendKind::Memory => Arc::new(MemoryBackend::new(config.endpoint.clone())),
    };
    Ok(backend)
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sandbox_allocator=info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    match args.command {
        Commands::Serve { port, backend } => {
            let config = Config::from_env();
            info!(
                backend = ?backend,
                subscription_id = %config.target.subscription_id,
                resource_group = %config.target.resource_group,
                region = %config.target.region,
                image = %config.template.image,
                "starting sandbox allocator"
            );

            let backend = match build_backend(backend, &config) {
                Ok(backend) => backend,
                Err(e) => {
                    error!(error = %e, "failed to set up sandbox backend");
                    exit(1);
                }
            };
            let state = AppState::new(backend, &config);
            if let Err(e) = http_server::run_server(port, state).await {
                error!(error = %e, "HTTP server failed");
                exit(1);
            }
        }
    }
}
