//! Radio Relay
//!
//! Relays one internet radio station, chosen from a catalog, as raw PCM to a
//! single downstream TCP client, with an HTTP control plane for switching
//! stations and querying "now playing" metadata.
//!
//! This library provides:
//! - The active-station store shared by the data and control planes
//! - The transcode pipeline (one external transcoder per client)
//! - The serial data-plane accept loop
//! - The HTTP control API and its event stream

pub mod api;
pub mod bus;
pub mod catalog;
pub mod config;
pub mod metadata;
pub mod persistence;
pub mod pipeline;
pub mod relay;
pub mod store;
