use crate::device::HistoryRow;
use chrono::DateTime;
use std::collections::BTreeMap;

/// The unit of persistence: one point per history row.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    /// Seconds since the epoch.
    pub timestamp: i64,
}

/// Map rows onto points, one to one and in order. Tags apply uniformly.
pub fn to_points(
    rows: &[HistoryRow],
    measurement: &str,
    tags: &BTreeMap<String, String>,
) -> Vec<Point> {
    rows.iter()
        .map(|row| Point {
            measurement: measurement.to_string(),
            tags: tags.clone(),
            fields: row.fields.clone(),
            timestamp: row.timestamp,
        })
        .collect()
}

/// Render epoch seconds as RFC 3339 for log lines.
pub fn format_ts(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}
