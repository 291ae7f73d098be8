//! InfluxDB 1.x over its HTTP API (`/query`, `/write`).

use super::line_protocol::encode_points;
use super::{http_client, read_body, Record, Storage};
use crate::config::{InfluxV1Config, DEVICE_TAG};
use crate::context::cancellable;
use crate::error::{AppError, Result};
use crate::mapping::Point;
use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct InfluxV1 {
    http: reqwest::Client,
    base_url: String,
    database: String,
    credentials: Option<(String, String)>,
    shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

impl InfluxV1 {
    pub fn new(cfg: &InfluxV1Config, timeout: Duration, shutdown: CancellationToken) -> Result<Self> {
        debug!(host = %cfg.host, database = %cfg.database, "initializing v1 client");
        Ok(Self {
            http: http_client(timeout)?,
            base_url: cfg.base_url(),
            database: cfg.database.clone(),
            credentials: cfg.username.clone().zip(cfg.password.clone()),
            shutdown,
        })
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, pass)) => req.basic_auth(user, Some(pass)),
            None => req,
        }
    }

    async fn run_query(&self, query: &str) -> Result<Vec<Record>> {
        debug!(query, "executing v1 query");
        let req = self
            .authorize(self.http.get(format!("{}/query", self.base_url)))
            .query(&[("db", self.database.as_str()), ("epoch", "s"), ("q", query)]);
        let body = cancellable(&self.shutdown, async {
            let resp = req
                .send()
                .await
                .map_err(|e| AppError::Storage(format!("query failed: {}", e)))?;
            read_body(resp, "query").await
        })
        .await?;
        let records = parse_query_response(&body)?;
        debug!(rows = records.len(), "v1 query returned");
        Ok(records)
    }
}

/// Flatten every series of every statement into column-keyed records.
fn parse_query_response(body: &str) -> Result<Vec<Record>> {
    let parsed: QueryResponse = serde_json::from_str(body)
        .map_err(|e| AppError::Storage(format!("invalid query response: {}", e)))?;
    if let Some(err) = parsed.error {
        return Err(AppError::Storage(err));
    }
    let mut records = Vec::new();
    for statement in parsed.results {
        if let Some(err) = statement.error {
            return Err(AppError::Storage(err));
        }
        for series in statement.series {
            for values in series.values {
                records.push(series.columns.iter().cloned().zip(values).collect());
            }
        }
    }
    Ok(records)
}

/// Double-quoted InfluxQL identifier.
fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Single-quoted InfluxQL string literal.
fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[async_trait]
impl Storage for InfluxV1 {
    async fn query(&self, query: &str) -> Result<Vec<Record>> {
        self.run_query(query).await
    }

    async fn write_points(&self, points: &[Point]) -> Result<()> {
        let body = encode_points(points);
        if body.is_empty() {
            return Ok(());
        }
        debug!(points = points.len(), "writing points to v1 influx");
        let req = self
            .authorize(self.http.post(format!("{}/write", self.base_url)))
            .query(&[("db", self.database.as_str()), ("precision", "s")])
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
        let query = format!(
            "SELECT \"total_act_energy\" FROM {} WHERE {} = {} ORDER BY time DESC LIMIT 1",
            quote_ident(measurement),
            quote_ident(DEVICE_TAG),
            quote_literal(device_name)
        );
        let records = self.run_query(&query).await?;
        let ts = records
            .first()
            .and_then(|r| r.get("time"))
            .and_then(|t| t.as_i64().or_else(|| t.as_f64().map(|f| f as i64)));
        debug!(measurement, device = device_name, ?ts, "last timestamp");
        Ok(ts)
    }

    async fn test_connection(&self) -> Result<()> {
        debug!("testing connection to v1 influx");
        let databases = self.run_query("SHOW DATABASES").await?;
        let exists = databases
            .iter()
            .filter_map(|r| r.get("name").and_then(Value::as_str))
            .any(|name| name == self.database);
        if !exists {
            return Err(AppError::Storage(format!(
                "Database '{}' does not exist",
                self.database
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!("closing v1 client (nothing buffered)");
        Ok(())
    }
}
