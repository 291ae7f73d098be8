//! History pages as returned by a metering device, their decoding into
//! per-sample rows, and the cursor walk that strings pages together.

use crate::error::{AppError, Result};
use async_trait::async_trait;
use futures::stream::{self, Stream, TryStreamExt};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PHASE_PREFIXES: [&str; 3] = ["a_", "b_", "c_"];
const PHASE_TOTALS: [&str; 2] = ["total_act_energy", "total_act_ret_energy"];

/// One response of the history endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawPage {
    #[serde(default)]
    pub keys: Option<Vec<String>>,
    pub data: Vec<RawBucket>,
    #[serde(default)]
    pub next_record_ts: Option<i64>,
}

/// A run of samples starting at `ts`, spaced `period` seconds apart.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawBucket {
    pub ts: i64,
    pub period: i64,
    /// Null cells are treated as absent fields.
    pub values: Vec<Vec<Option<f64>>>,
}

/// One sample interval.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub timestamp: i64,
    pub fields: BTreeMap<String, f64>,
}

/// Expand every bucket of a page into rows, in device order.
pub fn decode_page(page: &RawPage) -> Result<Vec<HistoryRow>> {
    let keys: &[String] = page.keys.as_deref().unwrap_or_default();
    let mut rows = Vec::new();
    for bucket in &page.data {
        for (index, cells) in bucket.values.iter().enumerate() {
            let timestamp = row_timestamp(bucket, index).ok_or_else(|| {
                AppError::Decode(format!(
                    "timestamp out of range in bucket ts={} period={} row={}",
                    bucket.ts, bucket.period, index
                ))
            })?;
            let mut fields: BTreeMap<String, f64> = keys
                .iter()
                .zip(cells)
                .filter_map(|(key, cell)| cell.map(|v| (key.clone(), v)))
                .collect();
            add_phase_totals(&mut fields);
            rows.push(HistoryRow { timestamp, fields });
        }
    }
    Ok(rows)
}

/// `ts + index * period`, `None` on overflow.
fn row_timestamp(bucket: &RawBucket, index: usize) -> Option<i64> {
    i64::try_from(index)
        .ok()?
        .checked_mul(bucket.period)?
        .checked_add(bucket.ts)
}

/// Inject `total_act_energy` / `total_act_ret_energy` when all three phases are present.
fn add_phase_totals(fields: &mut BTreeMap<String, f64>) {
    for total in PHASE_TOTALS {
        let phases: Option<Vec<f64>> = PHASE_PREFIXES
            .iter()
            .map(|prefix| fields.get(&format!("{}{}", prefix, total)).copied())
            .collect();
        if let Some(phases) = phases {
            fields.insert(total.to_string(), phases[0] + phases[1] + phases[2]);
        }
    }
}

/// Anything that can serve one bounded slice of device history.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, from: i64, to: Option<i64>) -> Result<RawPage>;
}

/// Lazy, pull-based walk over a device's history.
///
/// Each call to [`HistoryPages::next_page`] fetches until a page with rows turns up,
/// so empty pages are never handed out. The walk ends when the device stops
/// returning a positive cursor or the cursor passes the upper bound. After an
/// error the walk is over.
pub struct HistoryPages<'a, S: PageSource + ?Sized> {
    source: &'a S,
    cursor: Option<i64>,
    upper: Option<i64>,
    page_delay: Duration,
    shutdown: CancellationToken,
    requests: usize,
}

impl<'a, S: PageSource + ?Sized> HistoryPages<'a, S> {
    pub fn new(source: &'a S, from: i64, to: Option<i64>) -> Self {
        Self {
            source,
            cursor: Some(from),
            upper: to,
            page_delay: Duration::ZERO,
            shutdown: CancellationToken::new(),
            requests: 0,
        }
    }

    /// Pause between consecutive requests so the device is not hammered.
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Number of requests issued so far.
    pub fn requests(&self) -> usize {
        self.requests
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<HistoryRow>>> {
        while let Some(cursor) = self.cursor {
            if let Err(e) = self.pause().await {
                self.cursor = None;
                return Err(e);
            }
            let page = match self.source.fetch_page(cursor, self.upper).await {
                Ok(page) => page,
                Err(e) => {
                    self.cursor = None;
                    return Err(e);
                }
            };
            self.requests += 1;
            let rows = match decode_page(&page) {
                Ok(rows) => rows,
                Err(e) => {
                    self.cursor = None;
                    return Err(e);
                }
            };
            self.cursor = self.advance(cursor, page.next_record_ts);
            debug!(
                cursor,
                rows = rows.len(),
                next = ?self.cursor,
                "decoded history page"
            );
            if !rows.is_empty() {
                return Ok(Some(rows));
            }
        }
        Ok(None)
    }

    async fn pause(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        if self.requests == 0 || self.page_delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(AppError::Cancelled),
            _ = tokio::time::sleep(self.page_delay) => Ok(()),
        }
    }

    fn advance(&self, current: i64, next: Option<i64>) -> Option<i64> {
        let next = next.filter(|ts| *ts > 0)?;
        if let Some(upper) = self.upper {
            if next > upper {
                debug!(next, upper, "next cursor beyond upper bound");
                return None;
            }
        }
        if next <= current {
            warn!(current, next, "device returned a cursor that does not advance; stopping");
            return None;
        }
        Some(next)
    }

    /// Adapt the walk into a `Stream` of pages.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<HistoryRow>>> + 'a
    where
        S: 'a,
    {
        stream::try_unfold(self, |mut pages| async move {
            let next = pages.next_page().await?;
            Ok::<_, AppError>(next.map(|rows| (rows, pages)))
        })
    }
}

/// Fetch everything from `from` up to `to` (or the device's end) as one ordered sequence.
pub async fn fetch_history<S: PageSource + ?Sized>(
    source: &S,
    from: i64,
    to: Option<i64>,
    page_delay: Duration,
    shutdown: CancellationToken,
) -> Result<Vec<HistoryRow>> {
    let rows: Vec<HistoryRow> = HistoryPages::new(source, from, to)
        .with_page_delay(page_delay)
        .with_shutdown(shutdown)
        .into_stream()
        .try_concat()
        .await?;
    debug!(from, ?to, rows = rows.len(), "fetched history");
    Ok(rows)
}
