//! The container execution engine
//!
//! Caches remote image layers through the journal, spawns containers
//! under a bounded concurrency limiter, tracks every live container and
//! runs the background reaper and journal dumper for its whole lifetime.

mod container;
mod journal;
mod limiter;
mod reaper;

pub use container::TrackedContainer;
pub use journal::Journal;
pub use limiter::{SpawnLimiter, SpawnPermit, ADMISSION_LIMIT};

use crate::{
    backend::{Backend, ContainerSpec, OutputSink, ProcessOutput},
    config::EngineConfig,
    errors::{BackendError, EngineError},
    registry::{Profile, RegistryClient},
};
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const JOURNAL_DUMP_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Live containers, keyed by their namespace-prefixed name. Contended by
/// the spawn path (insert) and the reaper (remove).
pub type ContainerMap = Arc<Mutex<HashMap<String, TrackedContainer>>>;

/// Engine-wide counters, initialized at construction and injected where
/// needed rather than living in package-level globals.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// spawn requests currently waiting for a limiter permit
    pub spawn_queue_depth: Arc<AtomicUsize>,
    pub containers_created: AtomicU64,
    pub containers_errored: AtomicU64,
    pub spool_cache_hits: AtomicU64,
}

/// A spawn request as decoded from the wire.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub name: String,
    pub executable: String,
    pub args: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub profile: Profile,
}

/// Handle to a spawned process; terminate it via [Engine::terminate].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub id: String,
}

pub struct Engine {
    config: EngineConfig,
    journal: Arc<Journal>,
    limiter: SpawnLimiter,
    backend: Arc<dyn Backend>,
    registry: Arc<dyn RegistryClient>,
    containers: ContainerMap,
    root_prefix: String,
    metrics: Arc<EngineMetrics>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Construct the engine: validate configuration, load and reconcile
    /// the journal against the backend's live layers, and start the
    /// background reaper and journal dumper.
    pub async fn new(
        config: EngineConfig,
        backend: Arc<dyn Backend>,
        registry: Arc<dyn RegistryClient>,
    ) -> Result<Arc<Engine>, EngineError> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.layers).await?;
        tokio::fs::create_dir_all(&config.containers).await?;

        let journal = Arc::new(Journal::new());
        match std::fs::File::open(&config.journal) {
            Ok(file) => journal.load(file)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::warn!(
                    "journal file {:?} is absent, starting with an empty cache",
                    config.journal
                );
            }
            Err(err) => return Err(err.into()),
        }
        if config.weak_enabled {
            // weak cache keys must never be shared between daemon instances
            journal.reset_instance_id();
        }

        let root_prefix = backend.get_property("self", "absolute_name").await?;
        let live_layers = backend.list_layers().await?;
        let dropped = journal.retain_backed(&live_layers);
        if dropped > 0 {
            log::info!("dropped {} journal entries with no backend layer", dropped);
        }
        log::info!(
            "journal loaded with {} cached layers, instance id {}",
            journal.len(),
            journal.instance_id()
        );

        let metrics = Arc::new(EngineMetrics::default());
        let engine = Arc::new(Engine {
            limiter: SpawnLimiter::new(config.concurrency, metrics.spawn_queue_depth.clone()),
            journal,
            backend,
            registry,
            containers: Arc::new(Mutex::new(HashMap::new())),
            root_prefix,
            metrics,
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            config,
        });

        let reaper = tokio::spawn(reaper::run(
            engine.backend.clone(),
            engine.containers.clone(),
            engine.root_prefix.clone(),
            engine.shutdown.clone(),
        ));
        let dumper = tokio::spawn(dump_journal_every(
            engine.journal.clone(),
            engine.config.journal.clone(),
            JOURNAL_DUMP_INTERVAL,
            engine.shutdown.clone(),
        ));
        locked(&engine.workers).extend([reaper, dumper]);

        Ok(engine)
    }

    /// Resolve `name` through the registry and make sure a merged layer
    /// for it exists in the backend, using the journal as a cache.
    /// Idempotent: a second call with an unchanged remote digest is a
    /// cache hit and fetches nothing.
    pub async fn spool(
        &self,
        token: &CancellationToken,
        name: &str,
        profile: &Profile,
    ) -> Result<(), EngineError> {
        if profile.registry.is_empty() {
            return Err(EngineError::InvalidProfile(
                "registry must be non-empty".to_string(),
            ));
        }
        let (repository, reference) = split_reference(&profile.repository, name);
        let digest = self
            .registry
            .resolve(profile, &repository, &reference)
            .await?;

        let layer = self.layer_name(name);
        if self.journal.contains(&layer, &digest) {
            self.metrics.spool_cache_hits.fetch_add(1, Ordering::Relaxed);
            log::info!("layer {} has been found in the cache", digest);
            return Ok(());
        }

        let manifest = self.registry.manifest(profile, &repository, &digest).await?;

        // a stale layer under the same name must not merge into the new one
        match self.backend.remove_layer(&layer).await {
            Ok(()) | Err(BackendError::LayerNotFound) => {}
            Err(err) => return Err(err.into()),
        }

        log::info!("creating layer {} in the backend with merge", layer);
        for blob in manifest.ordered_digests() {
            if token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let tarball = self.registry.blob(profile, &repository, &blob).await?;
            self.backend.import_layer(&layer, &tarball, true).await?;
        }

        self.journal.insert(&layer, &digest);
        Ok(())
    }

    /// Create and start a container for a previously spooled image,
    /// streaming its output into `output`. The container is tracked
    /// before it is started so the reaper can observe a failed start.
    /// Cancellation is honored for the whole call, not only while the
    /// permit is awaited: a spawn cancelled mid-flight tears down what
    /// it already built and never reports success.
    pub async fn spawn(
        &self,
        token: &CancellationToken,
        config: SpawnConfig,
        output: OutputSink,
    ) -> Result<ProcessHandle, EngineError> {
        let _permit = self.limiter.acquire(token).await?;
        if token.is_cancelled() {
            return Err(EngineError::SpawnCancelled);
        }

        let container_id = Uuid::new_v4().to_string();
        let spec = ContainerSpec {
            id: self.scoped_name(&container_id),
            root: self.config.container_root_dir(&container_id),
            layer: self.layer_name(&config.name),
            executable: config.executable,
            args: config.args,
            env: config.env,
            cleanup: self.config.cleanup_enabled,
        };
        log::info!(
            "creating container {} (layer {}, root {:?})",
            spec.id,
            spec.layer,
            spec.root
        );

        self.metrics.containers_created.fetch_add(1, Ordering::Relaxed);
        let container = match TrackedContainer::create(self.backend.clone(), &spec).await {
            Ok(container) => container,
            Err(err) => {
                self.metrics.containers_errored.fetch_add(1, Ordering::Relaxed);
                return Err(err.into());
            }
        };
        locked(&self.containers).insert(spec.id.clone(), container);
        if token.is_cancelled() {
            self.abort_spawn(&spec.id, false).await;
            return Err(EngineError::SpawnCancelled);
        }

        if let Err(err) = self.backend.start(&spec.id, output.clone()).await {
            self.metrics.containers_errored.fetch_add(1, Ordering::Relaxed);
            self.abort_spawn(&spec.id, false).await;
            return Err(err.into());
        }
        if token.is_cancelled() {
            self.abort_spawn(&spec.id, true).await;
            return Err(EngineError::SpawnCancelled);
        }

        if output.send(ProcessOutput::Started).is_err() {
            log::warn!("output sink for {} closed before the start notice", spec.id);
        }
        Ok(ProcessHandle { id: spec.id })
    }

    /// Tear down a container whose spawn was abandoned partway: cleanup
    /// when it never started, a full kill when it did.
    async fn abort_spawn(&self, id: &str, started: bool) {
        let container = locked(&self.containers).remove(id);
        if let Some(container) = container {
            let result = if started {
                container.kill().await
            } else {
                container.cleanup().await
            };
            if let Err(err) = result {
                log::error!("teardown of abandoned spawn {} failed: {}", id, err);
            }
        }
    }

    /// Kill a tracked container and release its resources. Unknown ids
    /// are a no-op: the reaper may have retired the container already.
    pub async fn terminate(&self, id: &str) -> Result<(), EngineError> {
        let container = locked(&self.containers).remove(id);
        if let Some(container) = container {
            container.kill().await?;
        }
        Ok(())
    }

    /// Stop background workers and persist the journal one last time.
    /// Idempotent; a second call returns immediately.
    pub async fn close(&self) -> Result<(), EngineError> {
        self.shutdown.cancel();
        self.limiter.close();
        let workers: Vec<_> = locked(&self.workers).drain(..).collect();
        for worker in workers {
            if let Err(err) = worker.await {
                log::error!("engine worker failed to join: {}", err);
            }
        }
        Ok(())
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn container_count(&self) -> usize {
        locked(&self.containers).len()
    }

    /// Cache key for an image name: instance-id namespaced, with the
    /// weak-mode marker prefix when enabled.
    fn layer_name(&self, name: &str) -> String {
        let name = name.replace(':', "_");
        if self.config.weak_enabled {
            format!("_weak_{}{}", self.journal.instance_id(), name)
        } else {
            format!("{}{}", self.journal.instance_id(), name)
        }
    }

    /// Prefix a container id with the daemon's own backend namespace so
    /// nested or sibling daemons cannot collide.
    fn scoped_name(&self, container_id: &str) -> String {
        format!(
            "{}/{}",
            self.root_prefix.trim_end_matches('/'),
            container_id
        )
    }
}

/// Split an image name into its repository path under `repository_root`
/// and the tag reference, defaulting to `latest`.
fn split_reference(repository_root: &str, name: &str) -> (String, String) {
    let (image, tag) = match name.rsplit_once(':') {
        Some((image, tag)) => (image, tag),
        None => (name, "latest"),
    };
    let repository = if repository_root.is_empty() {
        image.to_string()
    } else {
        format!("{}/{}", repository_root.trim_end_matches('/'), image)
    };
    (repository, tag.to_string())
}

async fn dump_journal_every(
    journal: Arc<Journal>,
    path: PathBuf,
    every: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(every) => {
                if let Err(err) = dump_journal(&journal, &path).await {
                    log::error!("journal dump failed: {}", err);
                }
            }
            _ = shutdown.cancelled() => {
                if let Err(err) = dump_journal(&journal, &path).await {
                    log::error!("final journal dump failed: {}", err);
                }
                return;
            }
        }
    }
}

/// Persist a journal snapshot: write a temp file next to the target and
/// rename over it, so a crash mid-dump keeps the previous valid file.
async fn dump_journal(journal: &Journal, path: &Path) -> Result<(), EngineError> {
    let payload = journal.serialize()?;
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let temp = dir.join(format!("journal.{}.tmp", Uuid::new_v4()));
    tokio::fs::write(&temp, &payload).await?;
    if let Err(err) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(err.into());
    }
    log::debug!("journal dumped to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_reference_defaults_to_latest() {
        assert_eq!(
            split_reference("apps", "echo"),
            ("apps/echo".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_reference("apps", "echo:v3"),
            ("apps/echo".to_string(), "v3".to_string())
        );
        assert_eq!(
            split_reference("", "echo:v3"),
            ("echo".to_string(), "v3".to_string())
        );
    }
}
