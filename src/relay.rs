//! Data-plane loop
//!
//! Accepts downstream clients one at a time and runs one transcode pipeline
//! per client, inline. Because the next accept only happens after the current
//! run has been reaped, at most one pipeline exists at any moment and
//! "shut the recorded connection down" unambiguously targets it.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{RelayEvent, SharedBus};
use crate::pipeline::{RunOutcome, Transcoder};
use crate::store::{LiveConnection, SharedStore, StationStore};

pub struct Relay {
    store: SharedStore,
    transcoder: Transcoder,
    bus: SharedBus,
    /// Pause after a run that failed without delivering audio
    failure_backoff: Duration,
}

impl Relay {
    pub fn new(store: SharedStore, transcoder: Transcoder, bus: SharedBus) -> Self {
        Self {
            store,
            transcoder,
            bus,
            failure_backoff: Duration::ZERO,
        }
    }

    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }

    /// Serve clients until `shutdown` fires. Cancelling the token plays the
    /// role of closing the listener: the pending accept is abandoned and the
    /// listener dropped. A run already in progress is finished first.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!("Audio relay listening on {}. Waiting for a client...", addr),
            Err(e) => warn!("Audio relay listening on unknown address: {}", e),
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Listener closed, stopping audio relay");
                    break;
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.serve_client(stream, peer).await,
                Err(e) => warn!("Failed to accept connection: {}", e),
            }
        }
    }

    async fn serve_client(&self, stream: TcpStream, peer: SocketAddr) {
        let (stream, for_store, local) = match share_socket(stream, peer) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Failed to prepare connection from {}: {}", peer, e);
                return;
            }
        };

        let (index, station) = self.store.attach_connection(for_store).await;
        info!(
            "Client {} attached, streaming {} (index {})",
            peer, station.name, index
        );
        self.bus.publish(RelayEvent::ClientAttached {
            peer: peer.to_string(),
            index,
            station: station.name.clone(),
        });

        let report = self.transcoder.run(&station.stream_source, stream).await;

        self.store.detach_connection().await;
        local.close();

        if let RunOutcome::SpawnFailed(e) = &report.outcome {
            error!("Could not stream {} to {}: {}", station.name, peer, e);
        }
        info!(
            "Client {} detached after {} bytes ({})",
            peer,
            report.bytes_copied,
            report.outcome.summary()
        );
        self.bus.publish(RelayEvent::ClientDetached {
            peer: peer.to_string(),
            bytes_copied: report.bytes_copied,
            outcome: report.outcome.summary(),
        });

        if report.outcome.is_failure()
            && report.bytes_copied == 0
            && !self.failure_backoff.is_zero()
        {
            tokio::time::sleep(self.failure_backoff).await;
        }
    }
}

/// Split an accepted stream into the async stream used for I/O plus two
/// shutdown handles: one recorded in the store, one kept by the loop.
fn share_socket(
    stream: TcpStream,
    peer: SocketAddr,
) -> io::Result<(TcpStream, LiveConnection, LiveConnection)> {
    let socket = stream.into_std()?;
    let for_store = LiveConnection::new(socket.try_clone()?, peer);
    let local = LiveConnection::new(socket.try_clone()?, peer);
    let stream = TcpStream::from_std(socket)?;
    Ok((stream, for_store, local))
}

/// Final shutdown step, run however the control server ended: stop the relay,
/// give it `grace` to finish, then persist the index.
///
/// A client still streaming is not waited for past `grace`; its transcoder
/// exits once our end of the pipe is gone.
pub async fn wind_down(
    store: &StationStore,
    shutdown: &CancellationToken,
    relay_task: JoinHandle<()>,
    grace: Duration,
) {
    shutdown.cancel();
    match tokio::time::timeout(grace, relay_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Audio relay task ended abnormally: {}", e),
        Err(_) => info!("Audio relay still serving a client, leaving it behind"),
    }

    if let Err(e) = store.flush_index().await {
        warn!("Failed to persist station index on shutdown: {}", e);
    }
}
