//! shm-processor: connects to a fuzzing driver and serves requests over
//! System V shared memory until the driver goes away or a signal arrives.
//!
//! # Usage
//!
//! ```bash
//! shm-processor --variant keyed-input --identity rust
//! SHM_PROCESSOR_VARIANT=attach-by-id shm-processor --identity java --log debug
//! ```

mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use harness_core::{CancelToken, Namespace, ProcessorSession, SessionResources};
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::EnvFilter;

use crate::cli::Args;

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = match &args.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to create runtime");
            return ExitCode::FAILURE;
        }
    };

    rt.block_on(run(args))
}

async fn run(args: Args) -> ExitCode {
    let config = args.to_config();
    tracing::info!(
        endpoint = %config.endpoint.display(),
        identity = %config.identity,
        variant = ?args.variant,
        capacity = config.capacity,
        "starting processor"
    );

    let cancel = CancelToken::new();
    let session = ProcessorSession::new(config, Namespace::System, cancel.clone());
    let signals = tokio::spawn(watch_signals(cancel, session.resources()));

    let report = session.run().await;
    signals.abort();

    if report.outcome.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Wait for SIGINT or SIGTERM, then stop the session and release its
/// segments without waiting for the foreground loop.
async fn watch_signals(cancel: CancelToken, resources: Arc<SessionResources>) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            None
        }
    };
    let sigterm = async {
        match terminate.as_mut() {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = interrupt => tracing::info!("interrupt received, cleaning up"),
        _ = sigterm => tracing::info!("terminate received, cleaning up"),
    }

    cancel.cancel();
    if let Some(released) = resources.cleanup() {
        tracing::info!(
            detached = released.detached,
            destroyed = released.destroyed,
            "released shared memory"
        );
    }
}
