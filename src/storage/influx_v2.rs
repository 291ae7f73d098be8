//! InfluxDB 2.x over its HTTP API: line-protocol writes and Flux queries
//! answered as CSV.

use super::line_protocol::encode_points;
use super::{http_client, read_body, Record, Storage};
use crate::config::{InfluxV2Config, DEVICE_TAG};
use crate::context::cancellable;
use crate::error::{AppError, Result};
use crate::mapping::Point;
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::RequestBuilder;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How far back the watermark query looks; devices keep about 60 days of history.
const WATERMARK_RANGE: &str = "-61d";

pub struct InfluxV2 {
    http: reqwest::Client,
    base_url: String,
    token: String,
    org: String,
    bucket: String,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl InfluxV2 {
    pub fn new(cfg: &InfluxV2Config, timeout: Duration, shutdown: CancellationToken) -> Result<Self> {
        debug!(url = %cfg.url, bucket = %cfg.bucket, "initializing v2 client");
        Ok(Self {
            http: http_client(timeout)?,
            base_url: cfg.url.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
            org: cfg.org.clone(),
            bucket: cfg.bucket.clone(),
            closed: AtomicBool::new(false),
            shutdown,
        })
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        req.header(AUTHORIZATION, format!("Token {}", self.token))
    }

    async fn run_flux(&self, flux: &str) -> Result<Vec<Record>> {
        debug!(query = flux, "executing v2 query");
        let req = self
            .authorize(self.http.post(format!("{}/api/v2/query", self.base_url)))
            .query(&[("org", self.org.as_str())])
            .header(CONTENT_TYPE, "application/vnd.flux")
            .header(ACCEPT, "application/csv")
            .body(flux.to_string());
        let body = cancellable(&self.shutdown, async {
            let resp = req
                .send()
                .await
                .map_err(|e| AppError::Storage(format!("query failed: {}", e)))?;
            read_body(resp, "query").await
        })
        .await?;
        let records = parse_csv(&body)?;
        debug!(rows = records.len(), "v2 query returned");
        Ok(records)
    }
}

/// Decode a Flux CSV response. Tables are separated by blank lines and may
/// repeat their header; annotation rows (`#...`) are ignored.
fn parse_csv(body: &str) -> Result<Vec<Record>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());
    let mut header: Option<Vec<String>> = None;
    let mut records = Vec::new();

    for row in reader.records() {
        let row = row.map_err(|e| AppError::Storage(format!("invalid query response: {}", e)))?;
        if row.iter().all(str::is_empty) {
            header = None;
            continue;
        }
        if row.get(0).is_some_and(|cell| cell.starts_with('#')) {
            continue;
        }
        let is_header = row.get(1) == Some("result") && row.get(2) == Some("table");
        match &header {
            Some(columns) if !is_header => records.push(
                columns
                    .iter()
                    .zip(row.iter())
                    .filter(|(column, _)| !column.is_empty())
                    .map(|(column, cell)| (column.clone(), Value::String(cell.to_string())))
                    .collect(),
            ),
            _ => header = Some(row.iter().map(str::to_string).collect()),
        }
    }
    Ok(records)
}

/// Double-quoted Flux string literal.
fn flux_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

#[async_trait]
impl Storage for InfluxV2 {
    async fn query(&self, query: &str) -> Result<Vec<Record>> {
        self.run_flux(query).await
    }

    async fn write_points(&self, points: &[Point]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::Storage("write after close".into()));
        }
        let body = encode_points(points);
        if body.is_empty() {
            return Ok(());
        }
        debug!(points = points.len(), "writing points to v2 influx");
        let req = self
            .authorize(self.http.post(format!("{}/api/v2/write", self.base_url)))
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "s"),
            ])
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        cancellable(&self.shutdown, async {
            let resp = req
                .send()
                .await
                .map_err(|e| AppError::Storage(format!("write failed: {}", e)))?;
            read_body(resp, "write").await
        })
        .await?;
        Ok(())
    }

    async fn last_timestamp(&self, measurement: &str, device_name: &str) -> Result<Option<i64>> {
        let flux = format!(
            "from(bucket: {bucket})\n  |> range(start: {range})\n  |> filter(fn: (r) => r[\"_measurement\"] == {measurement})\n  |> filter(fn: (r) => r[{tag}] == {device})\n  |> filter(fn: (r) => r[\"_field\"] == \"total_act_energy\")\n  |> last()",
            bucket = flux_string(&self.bucket),
            range = WATERMARK_RANGE,
            measurement = flux_string(measurement),
            tag = flux_string(DEVICE_TAG),
            device = flux_string(device_name),
        );
        let records = self.run_flux(&flux).await?;
        let ts = match records.first().and_then(|r| r.get("_time")).and_then(Value::as_str) {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| AppError::Storage(format!("invalid _time {:?}: {}", raw, e)))?
                    .timestamp(),
            ),
            None => None,
        };
        debug!(measurement, device = device_name, ?ts, "last timestamp");
        Ok(ts)
    }

    async fn test_connection(&self) -> Result<()> {
        debug!("testing connection to v2 influx");
        let flux = format!(
            "buckets()\n  |> filter(fn: (r) => r.name == {})",
            flux_string(&self.bucket)
        );
        if self.run_flux(&flux).await?.is_empty() {
            return Err(AppError::Storage(format!(
                "Bucket '{}' does not exist",
                self.bucket
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        debug!("closed v2 client");
        Ok(())
    }
}
