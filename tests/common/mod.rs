//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use radio_relay::bus::{create_bus, SharedBus};
use radio_relay::catalog::{Catalog, StationDescriptor};
use radio_relay::persistence::IndexFile;
use radio_relay::store::{SharedStore, StationStore};

/// Catalog of `n` stations named `station-<i>` with stream sources `stream-<i>`
pub fn catalog(n: usize, metadata_base: &str) -> Catalog {
    Catalog::new(
        (0..n)
            .map(|i| StationDescriptor {
                name: format!("station-{}", i),
                stream_source: format!("stream-{}", i),
                metadata_source: format!("{}/station-{}.json", metadata_base, i),
            })
            .collect(),
    )
    .expect("non-empty catalog")
}

/// Store over `n` stations, seeded from a state file in `dir` holding `persisted`
pub fn store(dir: &Path, n: usize, persisted: Option<&str>, metadata_base: &str) -> (SharedStore, SharedBus) {
    let state_path = dir.join("state.txt");
    if let Some(content) = persisted {
        std::fs::write(&state_path, content).expect("write state file");
    }
    let bus = create_bus();
    let store = StationStore::restore(catalog(n, metadata_base), IndexFile::new(state_path), bus.clone());
    (Arc::new(store), bus)
}

/// Write an executable shell script standing in for the transcoder
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

/// Transcoder stand-in that repeats its input locator (`-i <source>`) forever,
/// one per line, and exits with the broken-pipe status once its output closes
pub fn echo_transcoder(dir: &Path) -> PathBuf {
    script(
        dir,
        "fake-ffmpeg",
        "while printf '%s\\n' \"$2\"; do :; done\nexit 224",
    )
}
