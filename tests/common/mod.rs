// Shared fixtures for the integration tests: an in-memory storage backend,
// a scripted page source and a mock metering device served over HTTP.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use em_history_sync::config::DEVICE_TAG;
use em_history_sync::device::{PageSource, RawBucket, RawPage};
use em_history_sync::storage::{Record, Storage};
use em_history_sync::{AppError, DeviceEndpoint, Point, Result};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// base64("admin:secret")
pub const BASIC_ADMIN_SECRET: &str = "Basic YWRtaW46c2VjcmV0";

pub fn device(host: &str) -> DeviceEndpoint {
    DeviceEndpoint {
        host: host.into(),
        username: None,
        password: None,
        tags: BTreeMap::from([(DEVICE_TAG.to_string(), "house".to_string())]),
        measurement: None,
    }
}

pub fn page(keys: &[&str], buckets: Vec<RawBucket>, next: Option<i64>) -> RawPage {
    RawPage {
        keys: Some(keys.iter().map(|k| k.to_string()).collect()),
        data: buckets,
        next_record_ts: next,
    }
}

/// `rows` samples of a single field starting at `ts`, `period` seconds apart.
pub fn bucket(ts: i64, period: i64, rows: usize) -> RawBucket {
    RawBucket {
        ts,
        period,
        values: (0..rows).map(|i| vec![Some(10.0 + i as f64)]).collect(),
    }
}

/// In-memory storage that can be told to fail.
#[derive(Default)]
pub struct MemoryStorage {
    points: Mutex<Vec<Point>>,
    writes: AtomicUsize,
    /// 1-based index of the write call that fails.
    fail_on_write: Option<usize>,
    fail_watermark: AtomicBool,
    /// Number of initial connectivity checks that fail.
    failing_checks: AtomicUsize,
    checks: AtomicUsize,
    closed: AtomicBool,
    watermark_reads: Mutex<Vec<Instant>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_write(nth: usize) -> Self {
        Self {
            fail_on_write: Some(nth),
            ..Self::default()
        }
    }

    pub fn with_failing_checks(self, count: usize) -> Self {
        self.failing_checks.store(count, Ordering::SeqCst);
        self
    }

    pub fn set_watermark_failure(&self, fail: bool) {
        self.fail_watermark.store(fail, Ordering::SeqCst);
    }

    pub fn points(&self) -> Vec<Point> {
        self.points.lock().unwrap().clone()
    }

    pub fn timestamps(&self) -> Vec<i64> {
        self.points().iter().map(|p| p.timestamp).collect()
    }

    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn connection_checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// When each cycle started, as seen by the watermark read.
    pub fn watermark_reads(&self) -> Vec<Instant> {
        self.watermark_reads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn query(&self, _query: &str) -> Result<Vec<Record>> {
        Ok(Vec::new())
    }

    async fn write_points(&self, points: &[Point]) -> Result<()> {
        let call = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_write == Some(call) {
            return Err(AppError::Storage(format!("write {} rejected", call)));
        }
        self.points.lock().unwrap().extend_from_slice(points);
        Ok(())
    }

    async fn last_timestamp(&self, measurement: &str, device_name: &str) -> Result<Option<i64>> {
        self.watermark_reads.lock().unwrap().push(Instant::now());
        if self.fail_watermark.load(Ordering::SeqCst) {
            return Err(AppError::Storage("watermark query failed".into()));
        }
        Ok(self
            .points
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.measurement == measurement)
            .filter(|p| p.tags.get(DEVICE_TAG).map(String::as_str) == Some(device_name))
            .map(|p| p.timestamp)
            .max())
    }

    async fn test_connection(&self) -> Result<()> {
        let check = self.checks.fetch_add(1, Ordering::SeqCst);
        if check < self.failing_checks.load(Ordering::SeqCst) {
            return Err(AppError::Storage("connection refused".into()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Page source driven by a cursor-keyed script. Unknown cursors answer with
/// an empty final page; the first `fail_first` requests fail.
#[derive(Default)]
pub struct ScriptedSource {
    pages: HashMap<i64, RawPage>,
    fail_first: usize,
    requests: Mutex<Vec<i64>>,
}

impl ScriptedSource {
    pub fn new(pages: Vec<(i64, RawPage)>) -> Self {
        Self {
            pages: pages.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn failing_first(mut self, count: usize) -> Self {
        self.fail_first = count;
        self
    }

    pub fn requested(&self) -> Vec<i64> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageSource for ScriptedSource {
    async fn fetch_page(&self, from: i64, _to: Option<i64>) -> Result<RawPage> {
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(from);
            requests.len()
        };
        if call <= self.fail_first {
            return Err(AppError::Transport("connection refused".into()));
        }
        Ok(self
            .pages
            .get(&from)
            .cloned()
            .unwrap_or_else(|| page(&[], Vec::new(), None)))
    }
}

/// Panics on its first `panics` requests, then serves an empty history.
pub struct PanickingSource {
    panics: usize,
    calls: Arc<AtomicUsize>,
}

impl PanickingSource {
    pub fn new(panics: usize) -> Self {
        Self {
            panics,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared request counter, still readable after the source is moved into a task.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl PageSource for PanickingSource {
    async fn fetch_page(&self, _from: i64, _to: Option<i64>) -> Result<RawPage> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.panics {
            panic!("page source blew up on request {}", call);
        }
        Ok(page(&[], Vec::new(), None))
    }
}

/// Log output captured from a `tracing` subscriber.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Install an `info`-level subscriber for the current thread, writing into `logs`.
pub fn capture_logs(logs: &CapturedLogs) -> tracing::subscriber::DefaultGuard {
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
        .with_ansi(false)
        .with_target(false)
        .compact()
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::set_default(subscriber)
}

/// Behaviour of the mock device.
#[derive(Default)]
pub struct MockDevice {
    /// Raw JSON bodies keyed by the requested `ts`.
    pub pages: HashMap<i64, Value>,
    /// Required `Authorization` header, if any.
    pub auth: Option<String>,
    /// Answer every history request with this status.
    pub status: Option<StatusCode>,
    /// Answer every history request with this raw body.
    pub raw_body: Option<String>,
    pub delay: Option<Duration>,
    pub requests: Mutex<Vec<HashMap<String, String>>>,
}

impl MockDevice {
    pub fn requested(&self) -> Vec<HashMap<String, String>> {
        self.requests.lock().unwrap().clone()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        match &self.auth {
            Some(expected) => headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == expected),
            None => true,
        }
    }
}

async fn get_data(
    State(mock): State<Arc<MockDevice>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    mock.requests.lock().unwrap().push(params.clone());
    if let Some(delay) = mock.delay {
        tokio::time::sleep(delay).await;
    }
    if !mock.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    if let Some(status) = mock.status {
        return (status, "device error").into_response();
    }
    if let Some(body) = &mock.raw_body {
        return (StatusCode::OK, body.clone()).into_response();
    }
    let ts = params
        .get("ts")
        .and_then(|ts| ts.parse::<i64>().ok())
        .unwrap_or_default();
    match mock.pages.get(&ts) {
        Some(body) => Json(body.clone()).into_response(),
        None => Json(json!({ "keys": [], "data": [] })).into_response(),
    }
}

async fn get_status(State(mock): State<Arc<MockDevice>>, headers: HeaderMap) -> Response {
    if !mock.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    Json(json!({ "sys": { "uptime": 1234 } })).into_response()
}

/// Serve `router` on an ephemeral local port.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

pub async fn spawn_device(mock: MockDevice) -> (SocketAddr, Arc<MockDevice>) {
    let mock = Arc::new(mock);
    let router = Router::new()
        .route("/rpc/EMData.GetData", get(get_data))
        .route("/rpc/Shelly.GetStatus", post(get_status))
        .with_state(mock.clone());
    (serve(router).await, mock)
}
