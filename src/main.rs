//! gable
//!
//! A reparenting X11 window manager core. Events are ingested in bounded
//! batches, coalesced, processed against a generational entity store, and
//! flushed as the minimal set of outbound requests, one cycle per wakeup.

mod config;
mod core;
mod stats;
mod transport;
mod wm;

use std::os::unix::net::UnixStream;

use anyhow::{Context, Result};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::{flag, low_level};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::transport::X11Transport;
use crate::wm::{Server, SignalFlags};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("gable {} starting", env!("CARGO_PKG_VERSION"));

    let config = Config::load().context("Failed to load configuration")?;
    let transport = X11Transport::connect(None)?;

    let (sig_read, sig_write) = UnixStream::pair().context("Failed to create signal pipe")?;
    sig_read
        .set_nonblocking(true)
        .context("Failed to configure signal pipe")?;
    sig_write
        .set_nonblocking(true)
        .context("Failed to configure signal pipe")?;

    let flags = SignalFlags::new();
    flag::register(SIGTERM, flags.shutdown.clone()).context("Failed to register SIGTERM")?;
    flag::register(SIGINT, flags.shutdown.clone()).context("Failed to register SIGINT")?;
    flag::register(SIGHUP, flags.reload.clone()).context("Failed to register SIGHUP")?;
    flag::register(SIGUSR1, flags.dump_stats.clone()).context("Failed to register SIGUSR1")?;
    for signal in [SIGTERM, SIGINT, SIGHUP, SIGUSR1] {
        // The pipe write wakes the poll loop so the flag is seen promptly.
        low_level::pipe::register(signal, sig_write.try_clone()?)
            .with_context(|| format!("Failed to register signal {}", signal))?;
    }

    let mut server = Server::new(transport, config);
    server.run(sig_read, flags)?;

    info!("gable shut down cleanly");
    Ok(())
}
