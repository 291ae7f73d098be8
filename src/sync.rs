use crate::config::DeviceEndpoint;
use crate::device::{HistoryPages, PageSource};
use crate::error::Result;
use crate::mapping::{format_ts, to_points};
use crate::storage::Storage;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Resume points below this mean the device's whole retained history will be pulled.
pub const COLD_START_THRESHOLD: i64 = 10;

/// Where the next fetch starts: one second past the watermark, or 0 without one.
pub fn resume_point(watermark: Option<i64>) -> i64 {
    watermark.map_or(0, |ts| ts + 1)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub resumed_from: i64,
    pub pages: usize,
    pub points: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Synced(SyncSummary),
    Failed,
    /// Shutdown interrupted the cycle.
    Cancelled,
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Synced(_))
    }
}

/// Runs sync cycles: watermark read, paged fetch, write per page.
#[derive(Clone)]
pub struct Syncer {
    storage: Arc<dyn Storage>,
    page_delay: Duration,
    shutdown: CancellationToken,
}

impl Syncer {
    pub fn new(storage: Arc<dyn Storage>, page_delay: Duration, shutdown: CancellationToken) -> Self {
        Self {
            storage,
            page_delay,
            shutdown,
        }
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// One cycle. Each page is written before the next one is requested, so
    /// pages already written stay durable when a later step fails.
    pub async fn sync<S: PageSource + ?Sized>(
        &self,
        device: &DeviceEndpoint,
        source: &S,
    ) -> Result<SyncSummary> {
        let measurement = device.measurement();
        let name = device.device_name();

        let watermark = self.storage.last_timestamp(measurement, name).await?;
        let from = resume_point(watermark);
        debug!(device = %name, measurement, ?watermark, from, "resuming history");
        if from < COLD_START_THRESHOLD {
            warn!(device = %name, "initial sync, this could take a while");
        }

        let mut summary = SyncSummary {
            resumed_from: from,
            ..SyncSummary::default()
        };
        let mut pages = HistoryPages::new(source, from, None)
            .with_page_delay(self.page_delay)
            .with_shutdown(self.shutdown.clone());
        while let Some(rows) = pages.next_page().await? {
            let points = to_points(&rows, measurement, &device.tags);
            self.storage.write_points(&points).await?;
            summary.pages += 1;
            summary.points += points.len();
            if let (Some(first), Some(last)) = (rows.first(), rows.last()) {
                info!(
                    device = %name,
                    measurement,
                    points = points.len(),
                    from = %format_ts(first.timestamp),
                    to = %format_ts(last.timestamp),
                    "wrote history page"
                );
            }
        }

        if summary.points == 0 {
            warn!(device = %name, "no new history data");
        }
        Ok(summary)
    }

    /// One cycle with every error logged and folded into the outcome.
    pub async fn run_cycle<S: PageSource + ?Sized>(
        &self,
        device: &DeviceEndpoint,
        source: &S,
    ) -> CycleOutcome {
        match self.sync(device, source).await {
            Ok(summary) => {
                info!(
                    device = %device.device_name(),
                    pages = summary.pages,
                    points = summary.points,
                    "sync cycle complete"
                );
                CycleOutcome::Synced(summary)
            }
            Err(e) if e.is_cancelled() => CycleOutcome::Cancelled,
            Err(e) => {
                error!(device = %device.device_name(), error = %e, "sync cycle failed");
                CycleOutcome::Failed
            }
        }
    }
}
