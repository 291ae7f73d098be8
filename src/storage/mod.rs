pub mod influx_v1;
pub mod influx_v2;
pub mod line_protocol;

use crate::config::StorageConfig;
use crate::error::{AppError, Result};
use crate::mapping::Point;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use influx_v1::InfluxV1;
pub use influx_v2::InfluxV2;

/// One result row of a backend query, keyed by column name.
pub type Record = BTreeMap<String, serde_json::Value>;

/// What the sync pipeline needs from a time-series store.
/// Implementations are shared across device tasks.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Run a raw query in the backend's own language.
    async fn query(&self, query: &str) -> Result<Vec<Record>>;

    async fn write_points(&self, points: &[Point]) -> Result<()>;

    /// Timestamp (epoch seconds) of the newest stored point for a device,
    /// `None` when nothing is stored yet.
    async fn last_timestamp(&self, measurement: &str, device_name: &str) -> Result<Option<i64>>;

    async fn test_connection(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Build the backend selected by the configuration.
pub fn from_config(
    cfg: &StorageConfig,
    timeout: Duration,
    shutdown: CancellationToken,
) -> Result<Arc<dyn Storage>> {
    match cfg {
        StorageConfig::V1(v1) => {
            debug!(url = %v1.base_url(), database = %v1.database, "using InfluxDB v1");
            Ok(Arc::new(InfluxV1::new(v1, timeout, shutdown)?))
        }
        StorageConfig::V2(v2) => {
            debug!(url = %v2.url, bucket = %v2.bucket, "using InfluxDB v2");
            Ok(Arc::new(InfluxV2::new(v2, timeout, shutdown)?))
        }
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::Storage(format!("failed to build HTTP client: {}", e)))
}

/// Read a response body, turning non-success statuses into storage errors.
pub(crate) async fn read_body(resp: reqwest::Response, action: &str) -> Result<String> {
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| AppError::Storage(format!("{} failed: {}", action, e)))?;
    if !status.is_success() {
        return Err(AppError::Storage(format!(
            "{} failed: HTTP {}: {}",
            action,
            status.as_u16(),
            body.trim()
        )));
    }
    Ok(body)
}
