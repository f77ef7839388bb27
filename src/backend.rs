//! The external container-runtime collaborator
//!
//! Isolation primitives themselves live behind this trait; the engine
//! only decides *when* to create, start, kill and reap.

use crate::errors::BackendError;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::sync::mpsc;

/// Events a running process reports to its caller-supplied sink. The
/// sender side is owned by the backend; the channel closing means the
/// process is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    /// the process has started successfully
    Started,
    /// one chunk of process output
    Data(Vec<u8>),
}

pub type OutputSink = mpsc::UnboundedSender<ProcessOutput>;

/// Everything the backend needs to create one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// namespace-prefixed container name
    pub id: String,
    /// per-container root directory
    pub root: PathBuf,
    /// merged image layer the root filesystem is built from
    pub layer: String,
    pub executable: String,
    pub args: HashMap<String, String>,
    pub env: HashMap<String, String>,
    /// destroy backing volumes when the container is removed
    pub cleanup: bool,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Read a property of a backend entity. `"self"` names the scope the
    /// daemon itself runs in.
    async fn get_property(&self, name: &str, property: &str) -> Result<String, BackendError>;

    async fn list_layers(&self) -> Result<Vec<String>, BackendError>;

    async fn remove_layer(&self, layer: &str) -> Result<(), BackendError>;

    /// Import a tarball as a layer. With `merge` set, the blob is merged
    /// into an existing layer of the same name instead of replacing it.
    async fn import_layer(
        &self,
        layer: &str,
        tarball: &Path,
        merge: bool,
    ) -> Result<(), BackendError>;

    async fn create(&self, spec: &ContainerSpec) -> Result<(), BackendError>;

    /// Start a created container, streaming its output into `output`.
    async fn start(&self, id: &str, output: OutputSink) -> Result<(), BackendError>;

    async fn kill(&self, id: &str) -> Result<(), BackendError>;

    /// Release every backend resource still held by a container.
    async fn destroy(&self, id: &str) -> Result<(), BackendError>;

    /// Block until an entity matching `pattern` dies and return its name,
    /// or `Ok(None)` when `timeout` elapses with nothing dead.
    async fn wait_dead(
        &self,
        pattern: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BackendError>;
}
