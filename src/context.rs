//! Process-wide context: one shutdown token shared by every device task and
//! the storage adapter, plus the tracker used to drain tasks on shutdown.

use crate::config::{DeviceEndpoint, SyncConfig};
use crate::device::{DeviceClient, PageSource};
use crate::error::{AppError, Result};
use crate::scheduler::{self, Backoff};
use crate::storage::Storage;
use crate::sync::Syncer;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Race `fut` against the shutdown token.
pub async fn cancellable<T, F>(shutdown: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(AppError::Cancelled),
        res = fut => res,
    }
}

pub struct AppContext {
    storage: Arc<dyn Storage>,
    sync: SyncConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl AppContext {
    pub fn new(storage: Arc<dyn Storage>, sync: SyncConfig, shutdown: CancellationToken) -> Self {
        Self {
            storage,
            sync,
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn syncer(&self) -> Syncer {
        Syncer::new(
            self.storage.clone(),
            self.sync.page_delay(),
            self.shutdown.clone(),
        )
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.sync.interval(), self.sync.max_backoff())
    }

    /// Block until storage answers, retrying with a fixed delay.
    /// Returns `false` if shutdown was requested first.
    pub async fn wait_for_storage(&self) -> bool {
        scheduler::wait_for_storage(
            self.storage.as_ref(),
            self.sync.storage_retry(),
            &self.shutdown,
        )
        .await
    }

    /// Start the sync loop for one device against its HTTP endpoint.
    pub fn spawn_device(&self, device: DeviceEndpoint) -> Result<()> {
        let client = DeviceClient::new(
            &device,
            self.sync.request_timeout(),
            self.shutdown.clone(),
        )?;
        let syncer = self.syncer();
        let backoff = self.backoff();
        self.tracker.spawn(async move {
            if !client.test_connection().await {
                warn!(
                    device = %device.device_name(),
                    url = %client.base_url(),
                    "device not reachable yet; the sync loop will keep retrying"
                );
            }
            scheduler::run_device_loop(syncer, device, client, backoff).await;
        });
        Ok(())
    }

    /// Start the sync loop for one device with an arbitrary page source.
    pub fn spawn_device_with<S>(&self, device: DeviceEndpoint, source: S)
    where
        S: PageSource + 'static,
    {
        let syncer = self.syncer();
        let backoff = self.backoff();
        self.tracker
            .spawn(scheduler::run_device_loop(syncer, device, source, backoff));
    }

    /// Cancel everything in flight, wait for the device tasks to finish,
    /// then close storage.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("all device tasks stopped");
        self.storage.close().await?;
        info!("storage closed");
        Ok(())
    }
}
