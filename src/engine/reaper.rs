//! Background lifecycle tracker
//!
//! Waits on the backend's death-notification API for anything under this
//! daemon's namespace and retires tracked containers as they die. The
//! loop survives backend connectivity loss and ends only on engine
//! shutdown.

use crate::{backend::Backend, engine::{locked, ContainerMap}};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// Used as a liveness heartbeat: a wait that returns empty-handed after
/// this long is not an error.
const WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub async fn run(
    backend: Arc<dyn Backend>,
    containers: ContainerMap,
    root_prefix: String,
    shutdown: CancellationToken,
) {
    let pattern = format!("{}/*", root_prefix.trim_end_matches('/'));
    log::info!("reaper started, watching {}", pattern);

    loop {
        let waited = tokio::select! {
            _ = shutdown.cancelled() => return,
            waited = backend.wait_dead(&pattern, WAIT_TIMEOUT) => waited,
        };
        match waited {
            // timeout with nothing dead, loop again
            Ok(None) => continue,
            Ok(Some(name)) => reap(&containers, &name).await,
            Err(err) => {
                log::warn!("reaper lost the backend: {}, reconnecting", err);
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
}

async fn reap(containers: &ContainerMap, name: &str) {
    // remove under the lock, kill outside it; absence means the container
    // was already retired by someone else
    let (container, remaining) = {
        let mut table = locked(containers);
        let container = table.remove(name);
        (container, table.len())
    };
    if let Some(container) = container {
        log::info!("backend reports {} to be dead", name);
        if let Err(err) = container.kill().await {
            log::error!("reaping {} failed: {}", name, err);
        }
    }
    log::info!("{} containers are being tracked now", remaining);
}
