//! A live container this daemon is responsible for reaping

use crate::{
    backend::{Backend, ContainerSpec},
    errors::BackendError,
};
use std::{path::PathBuf, sync::Arc};

/// One tracked container. Created by the spawn path, retired exactly once
/// by either the reaper or an explicit kill.
pub struct TrackedContainer {
    pub id: String,
    pub root_dir: PathBuf,
    backend: Arc<dyn Backend>,
    cleanup_enabled: bool,
}

impl TrackedContainer {
    /// Ask the backend to create the container described by `spec`.
    pub async fn create(
        backend: Arc<dyn Backend>,
        spec: &ContainerSpec,
    ) -> Result<Self, BackendError> {
        backend.create(spec).await?;
        Ok(TrackedContainer {
            id: spec.id.clone(),
            root_dir: spec.root.clone(),
            backend,
            cleanup_enabled: spec.cleanup,
        })
    }

    /// Kill the container and release its backend resources. An
    /// already-gone container is not an error.
    pub async fn kill(&self) -> Result<(), BackendError> {
        match self.backend.kill(&self.id).await {
            Ok(()) | Err(BackendError::ContainerNotFound) => {}
            Err(err) => log::error!("killing {} failed: {}", self.id, err),
        }
        self.cleanup().await
    }

    /// Release the resources of a container that may be half-created.
    pub async fn cleanup(&self) -> Result<(), BackendError> {
        if !self.cleanup_enabled {
            log::info!("cleanup is disabled, keeping {}", self.id);
            return Ok(());
        }
        match self.backend.destroy(&self.id).await {
            Err(BackendError::ContainerNotFound) => Ok(()),
            other => other,
        }
    }
}
