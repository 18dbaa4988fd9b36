//! Store configuration loading and validation.
//!
//! The configuration is a single JSON document naming the local OCI store
//! directory and any remote registries volumes may be pushed to or pulled
//! from.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, VolError};

/// Top-level store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local OCI store settings.
    pub local: LocalStore,

    /// Remote registries volumes can be copied to or from.
    #[serde(default)]
    pub remotes: Vec<RemoteStore>,
}

/// Local OCI store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStore {
    /// Store kind; only "oci" is supported.
    #[serde(rename = "type")]
    pub kind: String,

    /// Directory holding the OCI image layout.
    pub path: PathBuf,
}

/// A single remote registry target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStore {
    /// Unique name for this remote.
    pub name: String,

    /// Remote kind (e.g., "registry").
    #[serde(rename = "type", default)]
    pub kind: String,

    /// Registry hostname (e.g., "harbor.local").
    pub registry: String,

    /// Repository path within the registry (e.g., "project/repo").
    pub repository: String,

    /// Whether pushes to this remote are allowed.
    #[serde(default)]
    pub push: bool,

    /// Whether pulls from this remote are allowed.
    #[serde(default)]
    pub pull: bool,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

/// TLS settings for a remote registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Skip certificate verification.
    #[serde(default)]
    pub insecure: bool,

    /// Path to an additional CA certificate file.
    #[serde(default)]
    pub ca_file: String,
}

/// Credentials for a remote registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub token: String,
}

impl Config {
    /// Load and validate a configuration file.
    ///
    /// Refuses symlinks and other non-regular files before reading.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let meta = std::fs::symlink_metadata(path).map_err(|e| {
            VolError::Config(format!("stat config {}: {}", path.display(), e))
        })?;
        if !meta.is_file() {
            return Err(VolError::Config(format!(
                "config is not a regular file: {}",
                path.display()
            )));
        }

        let data = std::fs::read(path).map_err(|e| {
            VolError::Config(format!("open config {}: {}", path.display(), e))
        })?;
        let cfg: Config = serde_json::from_slice(&data)
            .map_err(|e| VolError::Config(format!("decode config JSON: {}", e)))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate required fields.
    fn validate(&self) -> Result<()> {
        if self.local.path.as_os_str().is_empty() {
            return Err(VolError::Config("local.path is empty".to_string()));
        }
        if self.local.kind != "oci" {
            return Err(VolError::Config(format!(
                "local.type must be 'oci', but got '{}'",
                self.local.kind
            )));
        }
        for (i, r) in self.remotes.iter().enumerate() {
            if r.name.is_empty() || r.registry.is_empty() || r.repository.is_empty() {
                return Err(VolError::Config(format!(
                    "remotes[{}] missing required fields",
                    i
                )));
            }
        }
        Ok(())
    }

    /// Ensure the local store directory exists, creating it if needed.
    pub fn ensure_dir(&self) -> Result<()> {
        if self.local.path.as_os_str().is_empty() {
            return Err(VolError::Config("local.path is empty".to_string()));
        }

        match std::fs::metadata(&self.local.path) {
            Ok(info) if info.is_dir() => Ok(()),
            Ok(_) => Err(VolError::Config(format!(
                "path '{}' already exists but is not a directory",
                self.local.path.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(&self.local.path).map_err(|e| {
                    VolError::Other(format!(
                        "failed to create directory '{}': {}",
                        self.local.path.display(),
                        e
                    ))
                })
            }
            Err(e) => Err(VolError::Other(format!(
                "failed to check directory '{}': {}",
                self.local.path.display(),
                e
            ))),
        }
    }
}
