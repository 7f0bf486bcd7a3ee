// ABOUTME: Starts component tasks in dependency order and coordinates graceful shutdown
// ABOUTME: Owns the shared handles (transactor, broadcaster) that every session borrows an Arc of

use crate::config::Config;
use crate::serial::SerialPort;
use crate::sniff::Broadcaster;
use crate::transactor::Transactor;
use crate::{shine, tcp_session};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::info;

/// How long shutdown waits for a transaction already holding the
/// downstream mutex to finish before the remaining tasks are aborted
/// (spec.md §4.8's "short grace deadline").
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Starts the transactor and broadcaster first, then the TCP listeners,
/// then the Shine session, per spec.md §4.8. Runs until a shutdown signal
/// arrives, then stops accepting new connections, gives any in-flight
/// transaction a grace period to finish, and only then tears down the
/// remaining worker tasks and closes the serial ports.
pub async fn run(config: Config) -> crate::error::Result<()> {
    let inverter_line = config.inverter_line()?;
    let shine_line = config.shine_line()?;
    let tcp_bind = config.tcp_bind;
    let tcp_alt_bind = config.tcp_alt_bind;
    let sniff_bind = config.sniff_bind;
    let min_period = config.min_period();
    let read_timeout = config.read_timeout();
    let log_path = config.log_path();
    let passthrough_enabled = config.shine_port != config.inverter_port;

    let inverter_port = SerialPort::new(config.inverter_port.to_string_lossy().into_owned(), inverter_line);

    let (sniffer, pump_rx, broadcaster) = Broadcaster::new(log_path);

    let transactor = Arc::new(Transactor::new(inverter_port, min_period, read_timeout, sniffer.clone()));

    // Acceptors only ever hand new work off to the transactor; none of them
    // hold the downstream mutex themselves, so they can be aborted the
    // moment a shutdown signal arrives without risking a mid-transaction cut.
    let mut acceptors = JoinSet::new();

    if let Some(sniff_bind) = sniff_bind {
        let broadcaster = broadcaster.clone();
        acceptors.spawn(async move {
            if let Err(e) = broadcaster.run_accept_loop(sniff_bind).await {
                tracing::error!(error = %e, "sniff accept loop exited");
            }
        });
    }

    {
        let transactor = transactor.clone();
        acceptors.spawn(async move {
            if let Err(e) = tcp_session::run_listener(tcp_bind, transactor, read_timeout).await {
                tracing::error!(error = %e, "primary TCP listener exited");
            }
        });
    }

    if let Some(alt_bind) = tcp_alt_bind {
        let transactor = transactor.clone();
        acceptors.spawn(async move {
            if let Err(e) = tcp_session::run_listener(alt_bind, transactor, read_timeout).await {
                tracing::error!(error = %e, "secondary TCP listener exited");
            }
        });
    }

    // Workers may be mid-transaction when a shutdown signal arrives, so
    // they are only aborted after `transactor.drain` confirms the downstream
    // mutex is free.
    let mut workers = JoinSet::new();

    workers.spawn(broadcaster.clone().run_pump(pump_rx));

    if passthrough_enabled {
        let shine_port = SerialPort::new(config.shine_port.to_string_lossy().into_owned(), shine_line);
        let transactor = transactor.clone();
        let sniffer = sniffer.clone();
        workers.spawn(async move {
            shine::run(shine_port, transactor, sniffer, read_timeout).await;
        });
    } else {
        info!("shine-port equals inverter-port, passthrough disabled");
    }

    info!("broker started, awaiting shutdown signal");
    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping");

    acceptors.abort_all();
    while acceptors.join_next().await.is_some() {}

    transactor.drain(SHUTDOWN_GRACE).await;

    broadcaster.shutdown();
    workers.abort_all();
    while workers.join_next().await.is_some() {}

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
