//! Shared scaffolding for the integration tests: scriptable in-memory
//! doubles for the isolation backend and the image registry.

// not every test binary touches every helper
#![allow(dead_code)]

use async_trait::async_trait;
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use stockade::{
    backend::{Backend, ContainerSpec, OutputSink},
    config::EngineConfig,
    engine::Engine,
    errors::{BackendError, RegistryError},
    manifest::{Link, Manifest, ManifestV2},
    registry::{Profile, RegistryClient},
};

pub fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

/// In-memory backend double. Layers and containers are plain vectors;
/// deaths are a script the reaper consumes through `wait_dead`.
#[derive(Default)]
pub struct MockBackend {
    pub layers: Mutex<Vec<String>>,
    pub created: Mutex<Vec<ContainerSpec>>,
    pub kills: Mutex<Vec<String>>,
    pub destroys: Mutex<Vec<String>>,
    pub fail_start: AtomicBool,
    pub start_delay: Mutex<Option<Duration>>,
    pub deaths: Mutex<VecDeque<Result<Option<String>, BackendError>>>,
}

impl MockBackend {
    pub fn with_layers(layers: &[&str]) -> Self {
        MockBackend {
            layers: Mutex::new(layers.iter().map(|layer| layer.to_string()).collect()),
            ..MockBackend::default()
        }
    }

    pub fn push_death(&self, name: &str) {
        lock(&self.deaths).push_back(Ok(Some(name.to_string())));
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn get_property(&self, name: &str, property: &str) -> Result<String, BackendError> {
        if name == "self" && property == "absolute_name" {
            Ok("ns".to_string())
        } else {
            Err(BackendError::Failure(format!(
                "unknown property {} of {}",
                property, name
            )))
        }
    }

    async fn list_layers(&self) -> Result<Vec<String>, BackendError> {
        Ok(lock(&self.layers).clone())
    }

    async fn remove_layer(&self, layer: &str) -> Result<(), BackendError> {
        let mut layers = lock(&self.layers);
        match layers.iter().position(|known| known == layer) {
            Some(index) => {
                layers.remove(index);
                Ok(())
            }
            None => Err(BackendError::LayerNotFound),
        }
    }

    async fn import_layer(
        &self,
        layer: &str,
        _tarball: &Path,
        _merge: bool,
    ) -> Result<(), BackendError> {
        let mut layers = lock(&self.layers);
        if !layers.iter().any(|known| known == layer) {
            layers.push(layer.to_string());
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), BackendError> {
        lock(&self.created).push(spec.clone());
        Ok(())
    }

    async fn start(&self, id: &str, _output: OutputSink) -> Result<(), BackendError> {
        let delay = *lock(&self.start_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            Err(BackendError::Failure(format!("unable to start {}", id)))
        } else {
            Ok(())
        }
    }

    async fn kill(&self, id: &str) -> Result<(), BackendError> {
        lock(&self.kills).push(id.to_string());
        Ok(())
    }

    async fn destroy(&self, id: &str) -> Result<(), BackendError> {
        lock(&self.destroys).push(id.to_string());
        Ok(())
    }

    async fn wait_dead(
        &self,
        _pattern: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BackendError> {
        let death = lock(&self.deaths).pop_front();
        match death {
            Some(death) => death,
            None => {
                tokio::time::sleep(timeout.min(Duration::from_millis(10))).await;
                Ok(None)
            }
        }
    }
}

/// Registry double serving one image: a fixed digest, a schema 2
/// manifest over `blob_digests`, and blobs materialized as empty files.
pub struct MockRegistry {
    pub digest: Mutex<String>,
    pub blob_digests: Vec<String>,
    pub blob_dir: PathBuf,
    pub resolves: AtomicUsize,
    pub manifests: AtomicUsize,
    pub blobs: AtomicUsize,
}

impl MockRegistry {
    pub fn new(blob_dir: PathBuf, digest: &str, blob_digests: &[&str]) -> Self {
        MockRegistry {
            digest: Mutex::new(digest.to_string()),
            blob_digests: blob_digests.iter().map(|blob| blob.to_string()).collect(),
            blob_dir,
            resolves: AtomicUsize::new(0),
            manifests: AtomicUsize::new(0),
            blobs: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RegistryClient for MockRegistry {
    async fn resolve(
        &self,
        _profile: &Profile,
        _repository: &str,
        _reference: &str,
    ) -> Result<String, RegistryError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.digest).clone())
    }

    async fn manifest(
        &self,
        _profile: &Profile,
        _repository: &str,
        _digest: &str,
    ) -> Result<Manifest, RegistryError> {
        self.manifests.fetch_add(1, Ordering::SeqCst);
        Ok(Manifest::V2(ManifestV2 {
            config: Link::default(),
            layers: self
                .blob_digests
                .iter()
                .map(|digest| Link {
                    digest: digest.clone(),
                    ..Link::default()
                })
                .collect(),
        }))
    }

    async fn blob(
        &self,
        _profile: &Profile,
        _repository: &str,
        digest: &str,
    ) -> Result<PathBuf, RegistryError> {
        self.blobs.fetch_add(1, Ordering::SeqCst);
        let path = self.blob_dir.join(digest.replace([':', '/'], "_"));
        tokio::fs::write(&path, b"").await?;
        Ok(path)
    }
}

pub fn test_config(root: &Path) -> EngineConfig {
    serde_json::from_value(serde_json::json!({
        "layers": root.join("layers"),
        "containers": root.join("containers"),
        "journal": root.join("journal"),
    }))
    .unwrap()
}

pub fn test_profile() -> Profile {
    Profile {
        registry: "registry.test".to_string(),
        repository: "apps".to_string(),
    }
}

/// Engine over the supplied doubles, rooted in `root`.
pub async fn test_engine(
    root: &Path,
    backend: Arc<MockBackend>,
    registry: Arc<MockRegistry>,
) -> Arc<Engine> {
    let _ = env_logger::builder().is_test(true).try_init();
    Engine::new(test_config(root), backend, registry)
        .await
        .unwrap()
}
