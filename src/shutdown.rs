//! Signal-driven drain for a worker process.
//!
//! Stopping a worker is not instantaneous: the coordination loop must
//! release its leases and delete its directory entry (so followers promote
//! immediately instead of waiting out the heartbeat TTL), and an in-flight
//! subprocess run is given the chance to finish and record its terminal
//! state. The first SIGTERM/SIGINT starts that drain by firing the returned
//! token. A second signal means the operator will not wait: the process
//! exits on the spot and peers discover the loss the slow way, via TTL
//! expiry and the orphan scan.

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Exit status reported when a second signal cuts the drain short,
/// conventionally 128 + SIGINT.
const ABANDONED_DRAIN_EXIT: i32 = 130;

pub fn drain_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let drain = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::info!(
            "Drain started: releasing leases, dropping directory entry, finishing current run"
        );
        drain.cancel();

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::warn!("Second signal during drain; exiting now, peers will see TTL expiry");
        std::process::exit(ABANDONED_DRAIN_EXIT);
    });

    token
}
