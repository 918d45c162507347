//! Station catalog
//!
//! The catalog is loaded once at startup from a JSON document and never changes
//! afterwards. It is guaranteed non-empty, so any index reduced modulo its
//! length is a valid station.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// One selectable station
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationDescriptor {
    pub name: String,
    /// Locator handed to the transcoder as its input
    #[serde(rename = "streamURL", alias = "stream_source", alias = "stream_url")]
    pub stream_source: String,
    /// Locator of the JSON "now playing" endpoint
    #[serde(
        rename = "metadataURL",
        alias = "metadata_source",
        alias = "metadata_url"
    )]
    pub metadata_source: String,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode catalog: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("no stations defined in catalog")]
    Empty,
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    stations: Vec<StationDescriptor>,
}

/// Immutable, non-empty, cheaply clonable list of stations
#[derive(Debug, Clone)]
pub struct Catalog {
    stations: Arc<[StationDescriptor]>,
}

impl Catalog {
    pub fn new(stations: Vec<StationDescriptor>) -> Result<Self, CatalogError> {
        if stations.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(Self {
            stations: stations.into(),
        })
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let doc: CatalogDocument = serde_json::from_str(json)?;
        Self::new(doc.stations)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    /// True when the catalog holds no stations
    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    /// Station at `index`, wrapping around the catalog length
    pub fn get(&self, index: usize) -> &StationDescriptor {
        &self.stations[index % self.stations.len()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &StationDescriptor> {
        self.stations.iter()
    }
}
