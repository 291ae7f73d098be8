//! InfluxDB line protocol encoding, second precision.

use crate::mapping::Point;
use tracing::debug;

/// Encode points, one line each. Points left without any finite field are skipped.
pub fn encode_points(points: &[Point]) -> String {
    let mut out = String::new();
    for point in points {
        match encode_point(point) {
            Some(line) => {
                out.push_str(&line);
                out.push('\n');
            }
            None => debug!(
                measurement = %point.measurement,
                ts = point.timestamp,
                "skipping point without fields"
            ),
        }
    }
    out
}

pub fn encode_point(point: &Point) -> Option<String> {
    let fields: Vec<String> = point
        .fields
        .iter()
        .filter(|(_, value)| value.is_finite())
        .map(|(key, value)| format!("{}={}", escape_key(key), value))
        .collect();
    if fields.is_empty() {
        return None;
    }

    let mut line = escape_measurement(&point.measurement);
    for (key, value) in &point.tags {
        if value.is_empty() {
            continue;
        }
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }
    line.push(' ');
    line.push_str(&fields.join(","));
    line.push(' ');
    line.push_str(&point.timestamp.to_string());
    Some(line)
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag keys, tag values and field keys share the same rules.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
