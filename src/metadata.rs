//! "Now playing" metadata lookups
//!
//! Each station exposes a JSON endpoint listing what is currently on air:
//!
//! ```json
//! {"nowplaying": [{"timestamp": "...", "artist": "...", "title": "..."}]}
//! ```
//!
//! The first entry wins. Lookups happen on demand and are never cached.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::catalog::StationDescriptor;

/// Some metadata endpoints reject non-browser clients
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongInfo {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub title: String,
}

impl SongInfo {
    /// Placeholder used when the endpoint reports nothing on air
    pub fn unknown() -> Self {
        Self {
            timestamp: "N/A".to_string(),
            artist: "Unknown".to_string(),
            title: "Unknown".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlaylistResponse {
    #[serde(default)]
    nowplaying: Vec<SongInfo>,
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("error fetching metadata: {0}")]
    Request(#[from] reqwest::Error),
    #[error("received non-success status code: {0}")]
    Status(u16),
    #[error("error decoding metadata JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("now playing list is empty")]
    EmptyNowPlaying { fallback: SongInfo },
}

/// Resolves the song currently on air for a station
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(&self, station: &StationDescriptor) -> Result<SongInfo, MetadataError>;
}

/// Pick the current song out of a metadata response body
pub fn parse_now_playing(body: &[u8]) -> Result<SongInfo, MetadataError> {
    let response: PlaylistResponse = serde_json::from_slice(body)?;
    response
        .nowplaying
        .into_iter()
        .next()
        .ok_or_else(|| MetadataError::EmptyNowPlaying {
            fallback: SongInfo::unknown(),
        })
}

/// Resolver issuing a GET against the station's metadata source
#[derive(Clone)]
pub struct HttpMetadataResolver {
    client: Client,
}

impl HttpMetadataResolver {
    pub fn new(timeout: Duration) -> Result<Self, MetadataError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MetadataResolver for HttpMetadataResolver {
    async fn resolve(&self, station: &StationDescriptor) -> Result<SongInfo, MetadataError> {
        let response = self.client.get(&station.metadata_source).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MetadataError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        parse_now_playing(&body)
    }
}
