//! Mock servers for integration testing
//!
//! Simulate the station metadata endpoints so resolver and control API
//! behavior can be tested without network access.

pub mod metadata;

pub use metadata::MockMetadataServer;
