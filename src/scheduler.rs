//! Per-device retry loop and the startup storage gate.

use crate::config::DeviceEndpoint;
use crate::device::PageSource;
use crate::storage::Storage;
use crate::sync::{CycleOutcome, Syncer};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Wait after a cycle: `base` after a success, `min(base * 2^failures, cap)` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.base;
        }
        2u32.checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |wait| wait.min(self.cap))
    }
}

/// Consecutive failures of one device. Lives only in memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    consecutive_failures: u32,
}

impl RetryState {
    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

/// Sync one device forever: cycle, wait, repeat. Cycles never overlap and the
/// loop only ends on shutdown.
pub async fn run_device_loop<S: PageSource>(
    syncer: Syncer,
    device: DeviceEndpoint,
    source: S,
    backoff: Backoff,
) {
    let shutdown = syncer.shutdown().clone();
    let name = device.device_name().to_string();
    let mut state = RetryState::default();
    info!(device = %name, "sync loop started");

    while !shutdown.is_cancelled() {
        let cycle = AssertUnwindSafe(syncer.run_cycle(&device, &source)).catch_unwind();
        match cycle.await {
            Ok(CycleOutcome::Synced(_)) => state.record_success(),
            Ok(CycleOutcome::Failed) => state.record_failure(),
            Ok(CycleOutcome::Cancelled) => break,
            Err(_) => {
                error!(device = %name, "unexpected panic during sync cycle");
                state.record_failure();
            }
        }

        let wait = backoff.delay(state.failures());
        if state.failures() > 0 {
            warn!(
                device = %name,
                failures = state.failures(),
                wait_secs = wait.as_secs(),
                "waiting before retry"
            );
        } else {
            debug!(device = %name, wait_secs = wait.as_secs(), "next sync scheduled");
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    info!(device = %name, "sync loop stopped");
}

/// Retry the storage connectivity check with a fixed delay until it passes.
/// Returns `false` when shutdown wins.
pub async fn wait_for_storage(
    storage: &dyn Storage,
    retry: Duration,
    shutdown: &CancellationToken,
) -> bool {
    loop {
        if shutdown.is_cancelled() {
            return false;
        }
        match storage.test_connection().await {
            Ok(()) => {
                info!("storage connection successful");
                return true;
            }
            Err(e) if e.is_cancelled() => return false,
            Err(e) => {
                error!(error = %e, "storage connection failed");
                info!(retry_secs = retry.as_secs(), "retrying storage connection");
            }
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return false,
            _ = tokio::time::sleep(retry) => {}
        }
    }
}
