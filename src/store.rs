//! Active-station store
//!
//! Holds the current catalog index and the handle of the one attached
//! downstream connection. Both fields live behind a single `RwLock` so that a
//! station switch and the severing of the old connection are one atomic step
//! with respect to a concurrent attach from the data plane.
//!
//! The lock is only ever held for the index/handle read-modify-write. Closing
//! a connection is a non-blocking `shutdown(2)` and is done under the lock;
//! persistence and event publishing happen after it is released.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::bus::{RelayEvent, SharedBus};
use crate::catalog::{Catalog, StationDescriptor};
use crate::persistence::{IndexFile, PersistenceError};

/// Control-plane view of the attached downstream connection.
///
/// Wraps a duplicate of the data plane's socket. The only thing done through
/// it is `shutdown`, which makes the data plane's pending I/O fail and so ends
/// the running pipeline.
#[derive(Debug)]
pub struct LiveConnection {
    peer: SocketAddr,
    attached_at: DateTime<Utc>,
    socket: TcpStream,
}

impl LiveConnection {
    pub fn new(socket: TcpStream, peer: SocketAddr) -> Self {
        Self {
            peer,
            attached_at: Utc::now(),
            socket,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn attached_at(&self) -> DateTime<Utc> {
        self.attached_at
    }

    /// Shut the socket down in both directions. Safe to call repeatedly.
    pub fn close(&self) {
        match self.socket.shutdown(Shutdown::Both) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotConnected => {}
            Err(e) => tracing::warn!("Failed to shut down connection to {}: {}", self.peer, e),
        }
    }
}

/// Result of a station switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StationSwitch {
    pub index: usize,
    pub station: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub peer: String,
    pub attached_at: DateTime<Utc>,
}

/// Consistent read of the store at one instant
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub index: usize,
    pub station: String,
    pub client: Option<ClientInfo>,
}

struct ActiveState {
    current_index: usize,
    live: Option<LiveConnection>,
}

pub struct StationStore {
    catalog: Catalog,
    state: RwLock<ActiveState>,
    index_file: IndexFile,
    /// Serializes index file writes so the file never ends up behind memory
    flush_lock: Mutex<()>,
    bus: SharedBus,
}

pub type SharedStore = Arc<StationStore>;

impl StationStore {
    pub fn new(
        catalog: Catalog,
        initial_index: usize,
        index_file: IndexFile,
        bus: SharedBus,
    ) -> Self {
        let current_index = initial_index % catalog.len();
        Self {
            catalog,
            state: RwLock::new(ActiveState {
                current_index,
                live: None,
            }),
            index_file,
            flush_lock: Mutex::new(()),
            bus,
        }
    }

    /// Build a store seeded from the persisted index
    pub fn restore(catalog: Catalog, index_file: IndexFile, bus: SharedBus) -> Self {
        let initial_index = index_file.load(catalog.len());
        Self::new(catalog, initial_index, index_file, bus)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub async fn current_station(&self) -> StationDescriptor {
        let state = self.state.read().await;
        self.catalog.get(state.current_index).clone()
    }

    /// Move to the next station, closing any attached connection first.
    ///
    /// The connection is shut down before this returns. The new index is then
    /// persisted; a failed write is logged and the in-memory switch stands.
    pub async fn advance_to_next(&self) -> StationSwitch {
        let switch = {
            let mut state = self.state.write().await;
            if let Some(conn) = state.live.take() {
                tracing::info!(
                    "Closing active connection to {} to switch station",
                    conn.peer()
                );
                conn.close();
            }
            state.current_index = (state.current_index + 1) % self.catalog.len();
            StationSwitch {
                index: state.current_index,
                station: self.catalog.get(state.current_index).name.clone(),
            }
        };

        if let Err(e) = self.flush_index().await {
            tracing::warn!("Failed to persist station index {}: {}", switch.index, e);
        }

        tracing::info!("Switched to next station: {} (index {})", switch.station, switch.index);
        self.bus.publish(RelayEvent::StationChanged {
            index: switch.index,
            station: switch.station.clone(),
        });
        switch
    }

    /// Record `conn` as the live connection and select the station it will be
    /// served, in one step under the write lock.
    pub async fn attach_connection(&self, conn: LiveConnection) -> (usize, StationDescriptor) {
        let mut state = self.state.write().await;
        if let Some(stale) = state.live.replace(conn) {
            tracing::warn!("Replacing stale live connection to {}", stale.peer());
            stale.close();
        }
        let index = state.current_index;
        (index, self.catalog.get(index).clone())
    }

    /// Forget the live connection. Returns whether one was recorded.
    pub async fn detach_connection(&self) -> bool {
        let mut state = self.state.write().await;
        state.live.take().is_some()
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.read().await;
        Snapshot {
            index: state.current_index,
            station: self.catalog.get(state.current_index).name.clone(),
            client: state.live.as_ref().map(|conn| ClientInfo {
                peer: conn.peer().to_string(),
                attached_at: conn.attached_at(),
            }),
        }
    }

    /// Write the current index to the state file
    pub async fn flush_index(&self) -> Result<(), PersistenceError> {
        let _flush_guard = self.flush_lock.lock().await;
        let index = self.state.read().await.current_index;
        self.index_file.save(index).await
    }
}
