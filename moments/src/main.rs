//! Worker binary entry point.
//!
//! Exit codes: 0 normal shutdown, 1 fatal init failure (coordination store or
//! registry unreachable), 2 invalid configuration.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use moments_pipeline::config::WorkerArgs;
use moments_pipeline::container::{ContainerConfig, ServiceContainer};
use moments_pipeline::governor::GovernorConfig;
use moments_pipeline::inference::InferenceConfig;
use moments_pipeline::media::FfmpegCodec;
use moments_pipeline::storage::fs::FsObjectStore;
use moments_pipeline::storage::memory::in_memory_repositories;
use moments_pipeline::tunnel::TunnelConfig;
use moments_pipeline::worker::Worker;
use moments_pipeline::{Result, logging};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = WorkerArgs::parse();

    if let Err(e) = args.validate() {
        eprintln!("invalid configuration: {e}");
        return ExitCode::from(2);
    }

    let _log_guard = match logging::init(args.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            return ExitCode::from(2);
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Worker terminated with a fatal error");
            ExitCode::from(1)
        }
    }
}

async fn run(args: WorkerArgs) -> Result<()> {
    let governor = GovernorConfig {
        max_concurrent_runs: args.max_concurrent,
        ..Default::default()
    };

    let container = ServiceContainer::new(
        ContainerConfig {
            redis_url: args.redis_url.clone(),
            stream: args.stream.clone(),
            group: args.group.clone(),
            lock_ttl_seconds: args.lock_ttl_seconds,
            transcription_model: args.transcription_model.clone(),
            governor,
            inference: InferenceConfig::default(),
            tunnel: TunnelConfig::default(),
        },
        in_memory_repositories(),
        Arc::new(FsObjectStore::new(args.data_dir.join("objects"))),
        Arc::new(FfmpegCodec::new()),
    )
    .await?;

    container.registry.seed_defaults().await?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    Worker::new(container, args, shutdown).run().await
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        error!(error = %e, "Failed to install SIGTERM handler");
                        let _ = ctrl_c.await;
                        shutdown.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received Ctrl-C");
        }

        shutdown.cancel();
    });
}
