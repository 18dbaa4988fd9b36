//! Volstow Core - Foundational Types and Abstractions
//!
//! This module provides the shared types used across the Volstow volume
//! store: the error enum, store configuration, and the volume metadata
//! model (partitions, indexes, and the published-volume collection).

pub mod config;
pub mod error;
pub mod volume;

// Re-export commonly used types
pub use config::{AuthConfig, Config, LocalStore, RemoteStore, TlsConfig};
pub use error::{Result, VolError};
pub use volume::{ConfigBlob, Partition, VolumeCollection, VolumeEntry, VolumeIndex};

/// Volstow version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
