//! mountctl - foreground control process for mountplane
//!
//! Drives the mount helper and the endpoint service from the command line.
//! `serve-app` turns it into the long-running UI analog: it exports the App
//! interface, publishes that endpoint on the service, and mirrors mount state
//! into a local bus whose callbacks run on the main thread.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use mountplane_kernel::MountEventBus;

mod cli;
mod commands;
mod constants;
mod endpoint;
#[cfg(test)]
mod testing;
mod view;

use cli::Cli;
use constants::{ENV_LOG_DIR, LOG_FILE};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up file logging
    let log_dir = std::env::var(ENV_LOG_DIR).unwrap_or_else(|_| "/tmp".to_string());
    let file_appender = tracing_appender::rolling::never(&log_dir, LOG_FILE);
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Chatty in the file, quiet on the terminal unless asked
            "mountctl=debug,mountplane_client=debug,warn".into()
        }))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(fmt::layer().with_writer(std::io::stderr).with_filter(
            tracing_subscriber::filter::LevelFilter::WARN,
        ))
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("mountctl: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    // The future passed to block_on is polled on this thread, so the pump
    // driven inside it delivers on the main thread.
    let (bus, pump) = MountEventBus::new();
    match runtime.block_on(commands::run(cli, pump, bus)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("mountctl: {e:#}");
            ExitCode::FAILURE
        }
    }
}
