//! Support for resolving and downloading image content from a registry
//! server
//!
//! The engine only ever asks three questions: what digest does this tag
//! point at, what does that manifest contain, and where is a verified
//! local copy of this blob. Anything that can answer those implements
//! [RegistryClient]; [HttpRegistryClient] is the stock answer.

use crate::{
    config::EngineConfig,
    errors::RegistryError,
    manifest::{media_types, Manifest},
};
use async_trait::async_trait;
use rand::Rng;
use reqwest::header;
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Where an image lives: a registry host and a repository root the image
/// name is joined onto. Decoded from the per-request profile arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub registry: String,
    pub repository: String,
}

impl Profile {
    /// Registry base URL; hosts without an explicit scheme are HTTPS.
    pub fn base_url(&self) -> String {
        if self.registry.starts_with("http") {
            self.registry.clone()
        } else {
            format!("https://{}", self.registry)
        }
    }
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Resolve a tag or digest reference to the concrete content digest
    /// the registry currently serves for it.
    async fn resolve(
        &self,
        profile: &Profile,
        repository: &str,
        reference: &str,
    ) -> Result<String, RegistryError>;

    /// Fetch and parse the manifest stored under `digest`.
    async fn manifest(
        &self,
        profile: &Profile,
        repository: &str,
        digest: &str,
    ) -> Result<Manifest, RegistryError>;

    /// Fetch a blob into local storage and return the path of the
    /// verified tarball. Already-present blobs are not fetched again.
    async fn blob(
        &self,
        profile: &Profile,
        repository: &str,
        digest: &str,
    ) -> Result<PathBuf, RegistryError>;
}

/// Registry client speaking the v2 HTTP distribution protocol, with
/// per-registry authorization and bounded retry on connection errors.
pub struct HttpRegistryClient {
    req: reqwest::Client,
    auth: HashMap<String, String>,
    blob_dir: PathBuf,
    retries: u32,
}

impl HttpRegistryClient {
    pub fn new(
        blob_dir: PathBuf,
        auth: HashMap<String, String>,
        retries: u32,
    ) -> Result<Self, RegistryError> {
        static USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
        let req = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(HttpRegistryClient {
            req,
            auth,
            blob_dir,
            retries,
        })
    }

    /// Build a client from the engine configuration, storing blobs next
    /// to the merged layers.
    pub fn from_config(config: &EngineConfig) -> Result<Self, RegistryError> {
        HttpRegistryClient::new(
            config.layers.clone(),
            config.registry_auth.clone(),
            config.dial_retries,
        )
    }

    /// GET with retry on connect/timeout failures only; HTTP-level errors
    /// (bad reference, missing repository) fail fast.
    async fn get(
        &self,
        profile: &Profile,
        url: &str,
        accept: &str,
    ) -> Result<reqwest::Response, RegistryError> {
        let mut attempt = 0;
        loop {
            let mut request = self.req.get(url).header(header::ACCEPT, accept);
            if let Some(token) = self.auth.get(&profile.registry) {
                request = request.header(header::AUTHORIZATION, token);
            }
            match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(response) => return Ok(response),
                Err(err)
                    if attempt < self.retries && (err.is_connect() || err.is_timeout()) =>
                {
                    let pause =
                        Duration::from_millis(rand::thread_rng().gen_range(0..500));
                    log::error!(
                        "request to {} failed ({}), retrying in {:?}",
                        url,
                        err,
                        pause
                    );
                    tokio::time::sleep(pause).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn manifest_url(&self, profile: &Profile, repository: &str, reference: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            profile.base_url(),
            repository,
            reference
        )
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.blob_dir.join(digest.replace([':', '/'], "_"))
    }
}

fn accept_manifests() -> String {
    format!("{}, {}", media_types::MANIFEST_V2, media_types::MANIFEST_V1)
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn resolve(
        &self,
        profile: &Profile,
        repository: &str,
        reference: &str,
    ) -> Result<String, RegistryError> {
        let url = self.manifest_url(profile, repository, reference);
        let response = self.get(profile, &url, &accept_manifests()).await?;
        response
            .headers()
            .get("docker-content-digest")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| RegistryError::MissingDigest(url))
    }

    async fn manifest(
        &self,
        profile: &Profile,
        repository: &str,
        digest: &str,
    ) -> Result<Manifest, RegistryError> {
        let url = self.manifest_url(profile, repository, digest);
        let response = self.get(profile, &url, &accept_manifests()).await?;
        let body = response.bytes().await?;
        log::trace!("raw json manifest, {}", String::from_utf8_lossy(&body));
        Ok(serde_json::from_slice(&body)?)
    }

    async fn blob(
        &self,
        profile: &Profile,
        repository: &str,
        digest: &str,
    ) -> Result<PathBuf, RegistryError> {
        let dest = self.blob_path(digest);
        if tokio::fs::metadata(&dest).await.is_ok() {
            log::debug!("blob {} is already in local storage", digest);
            return Ok(dest);
        }

        let expected_hex = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| RegistryError::UnsupportedDigest(digest.to_string()))?;

        let url = format!("{}/v2/{}/blobs/{}", profile.base_url(), repository, digest);
        log::info!("downloading blob {} ...", digest);
        let mut response = self.get(profile, &url, "*/*").await?;

        // stream into a temp file, hashing as we go; commit by rename
        let temp = self.blob_dir.join(format!("tmp.{}", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&temp).await?;
        let mut hasher = Sha256::new();
        let result: Result<(), RegistryError> = loop {
            match response.chunk().await {
                Err(err) => break Err(err.into()),
                Ok(None) => break Ok(()),
                Ok(Some(chunk)) => {
                    hasher.update(&chunk);
                    if let Err(err) = file.write_all(&chunk).await {
                        break Err(err.into());
                    }
                }
            }
        };
        if let Err(err) = result {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(err);
        }
        file.flush().await?;
        drop(file);

        let found_hex = hex_digest(&hasher.finalize());
        if found_hex != expected_hex {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(RegistryError::ContentDigestMismatch {
                expected: digest.to_string(),
                found: format!("sha256:{}", found_hex),
            });
        }

        tokio::fs::rename(&temp, &dest).await?;
        log::debug!("blob {} committed to {:?}", digest, dest);
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_defaults_to_https() {
        let profile = Profile {
            registry: "registry.test:5000".into(),
            repository: "apps".into(),
        };
        assert_eq!(profile.base_url(), "https://registry.test:5000");

        let plain = Profile {
            registry: "http://registry.test".into(),
            repository: "apps".into(),
        };
        assert_eq!(plain.base_url(), "http://registry.test");
    }

    #[test]
    fn blob_paths_are_filesystem_safe() {
        let client = HttpRegistryClient::new(PathBuf::from("/l"), HashMap::new(), 0).unwrap();
        assert_eq!(
            client.blob_path("sha256:abc/def"),
            PathBuf::from("/l/sha256_abc_def")
        );
    }

    #[test]
    fn hex_digest_formats_bytes() {
        assert_eq!(hex_digest(&[0x00, 0xff, 0x1a]), "00ff1a");
    }
}
