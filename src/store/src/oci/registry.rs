//! Remote registry client for pushing published volumes.
//!
//! Uses the `oci-distribution` crate to copy a tagged volume artifact
//! from a local image layout to a remote repository (Harbor, GHCR, etc.).
//! Credentials come from the store configuration's per-remote `auth`
//! block; TLS and HTTP retry behavior come from the client.

use std::path::Path;

use oci_distribution::client::{Client, ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;

use volstow_core::config::AuthConfig;
use volstow_core::error::{Result, VolError};

use super::layout::OciLayout;
use super::{BlobStore, OciImageManifest};

/// Map a remote's configured credentials onto the client's auth modes.
///
/// A blank username or password means the push goes out unauthenticated.
fn client_auth(auth: &AuthConfig) -> RegistryAuth {
    if auth.username.is_empty() || auth.password.is_empty() {
        RegistryAuth::Anonymous
    } else {
        RegistryAuth::Basic(auth.username.clone(), auth.password.clone())
    }
}

/// Copy the volume tagged `tag` from the local store at `local_store` to
/// `remote_repo` under the same tag.
///
/// `remote_repo` is the repository string without a tag (e.g.
/// `harbor.local/demo-project/testrepo`). With `plain_http` the client
/// speaks HTTP instead of HTTPS.
///
/// Returns the URL the manifest was pushed to.
pub async fn push_local_to_remote(
    local_store: &Path,
    tag: &str,
    remote_repo: &str,
    auth: &AuthConfig,
    plain_http: bool,
) -> Result<String> {
    let store = OciLayout::open(local_store).await?;

    let manifest_desc = store.resolve(tag).await?;
    let manifest_data = store.fetch(&manifest_desc).await?;
    let manifest: OciImageManifest = serde_json::from_slice(&manifest_data).map_err(|e| {
        VolError::Format(format!(
            "failed to decode manifest {}: {}",
            manifest_desc.digest, e
        ))
    })?;

    let config_data = store.fetch(&manifest.config).await?;
    let config = Config::new(
        config_data,
        manifest.config.media_type.clone(),
        manifest.config.annotations.clone(),
    );

    let mut layers = Vec::with_capacity(manifest.layers.len());
    for layer in &manifest.layers {
        let data = store.fetch(layer).await?;
        layers.push(ImageLayer::new(
            data,
            layer.media_type.clone(),
            layer.annotations.clone(),
        ));
    }

    let reference: Reference = format!("{}:{}", remote_repo, tag).parse().map_err(|e| {
        VolError::Format(format!(
            "invalid remote reference '{}:{}': {}",
            remote_repo, tag, e
        ))
    })?;

    let protocol = if plain_http {
        ClientProtocol::Http
    } else {
        ClientProtocol::Https
    };
    let client = Client::new(ClientConfig {
        protocol,
        ..Default::default()
    });

    tracing::info!(reference = %reference, "pushing volume to remote registry");

    let response = client
        .push(&reference, &layers, config, &client_auth(auth), Some(manifest))
        .await
        .map_err(|e| {
            VolError::Storage(format!(
                "failed to push {:?} to {}: {}",
                tag, remote_repo, e
            ))
        })?;

    tracing::info!(
        reference = %reference,
        manifest_url = %response.manifest_url,
        "volume pushed to remote registry"
    );

    Ok(response.manifest_url)
}
