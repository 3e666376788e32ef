//! ==============================================================================
//! sink.rs - where processed samples go
//! ==============================================================================
//!
//! purpose:
//!     persists samples and answers "latest value of measurement T for this
//!     device, no older than max_age". threshold rules are evaluated against
//!     these answers, not against the controller's in-memory sample.
//!
//! implementations:
//!     - MemorySink: bounded in-process history. default, and used by tests.
//!     - InfluxSink: influxdb 1.x http api (line protocol writes, influxql reads).
//!
//! ==============================================================================

use crate::config::SinkConfig;
use crate::error::SinkError;
use crate::sensor::{now_ms, Sample};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// history kept per (device, measurement) series in memory
const MEMORY_HISTORY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub device_id: String,
    pub measurement: String,
    pub value: f64,
    pub timestamp_ms: u64,
}

/// one point per measurement in the sample; the whole sample is one batch
pub fn points_for(device_id: &str, sample: &Sample) -> Vec<Point> {
    sample
        .values
        .iter()
        .map(|(measurement, value)| Point {
            device_id: device_id.to_string(),
            measurement: measurement.clone(),
            value: *value,
            timestamp_ms: sample.timestamp_ms,
        })
        .collect()
}

#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn write(&self, points: &[Point]) -> Result<(), SinkError>;

    async fn read_latest(
        &self,
        device_id: &str,
        measurement: &str,
        max_age: Duration,
    ) -> Result<Option<f64>, SinkError>;
}

// ==============================================================================
// in-memory sink
// ==============================================================================

#[derive(Default)]
pub struct MemorySink {
    series: Mutex<HashMap<(String, String), VecDeque<(u64, f64)>>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// make every write fail with a transport error (outage simulation)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// all stored values of one series, oldest first
    pub fn history(&self, device_id: &str, measurement: &str) -> Vec<f64> {
        self.series
            .lock()
            .map(|s| {
                s.get(&(device_id.to_string(), measurement.to_string()))
                    .map(|h| h.iter().map(|(_, v)| *v).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl SampleSink for MemorySink {
    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Transport("memory sink is offline".to_string()));
        }
        let mut series = self
            .series
            .lock()
            .map_err(|_| SinkError::Transport("memory sink poisoned".to_string()))?;
        for p in points {
            let history = series.entry((p.device_id.clone(), p.measurement.clone())).or_default();
            history.push_back((p.timestamp_ms, p.value));
            while history.len() > MEMORY_HISTORY {
                history.pop_front();
            }
        }
        Ok(())
    }

    async fn read_latest(
        &self,
        device_id: &str,
        measurement: &str,
        max_age: Duration,
    ) -> Result<Option<f64>, SinkError> {
        let series = self
            .series
            .lock()
            .map_err(|_| SinkError::Transport("memory sink poisoned".to_string()))?;
        let cutoff = now_ms().saturating_sub(max_age.as_millis() as u64);
        Ok(series
            .get(&(device_id.to_string(), measurement.to_string()))
            .and_then(|h| h.back())
            .filter(|(ts, _)| *ts >= cutoff)
            .map(|(_, v)| *v))
    }
}

// ==============================================================================
// influxdb sink
// ==============================================================================

pub struct InfluxSink {
    client: reqwest::Client,
    url: String,
    database: String,
}

impl InfluxSink {
    pub fn new(config: &SinkConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            database: config.database.clone(),
        })
    }
}

/// escape commas, spaces and equals signs in measurement names and tag values
fn escape_tag(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, ',' | ' ' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn line_protocol(points: &[Point]) -> String {
    points
        .iter()
        .map(|p| {
            format!(
                "{},device_id={} value={} {}",
                escape_tag(&p.measurement),
                escape_tag(&p.device_id),
                p.value,
                p.timestamp_ms
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn influxql_latest(device_id: &str, measurement: &str, max_age: Duration) -> String {
    format!(
        "SELECT last(value) FROM \"{}\" WHERE device_id = '{}' AND time > now() - {}s",
        measurement.replace('"', "\\\""),
        device_id.replace('\'', "\\'"),
        max_age.as_secs().max(1)
    )
}

/// pull `results[0].series[0].values[0][1]` out of an influxql response
fn parse_last_value(body: &serde_json::Value) -> Option<f64> {
    body["results"][0]["series"][0]["values"][0][1].as_f64()
}

#[async_trait]
impl SampleSink for InfluxSink {
    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        if points.is_empty() {
            return Ok(());
        }
        let response = self
            .client
            .post(format!("{}/write", self.url))
            .query(&[("db", self.database.as_str()), ("precision", "ms")])
            .body(line_protocol(points))
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SinkError::Response(format!("write returned {}", response.status())));
        }
        Ok(())
    }

    async fn read_latest(
        &self,
        device_id: &str,
        measurement: &str,
        max_age: Duration,
    ) -> Result<Option<f64>, SinkError> {
        let query = influxql_latest(device_id, measurement, max_age);
        let response = self
            .client
            .get(format!("{}/query", self.url))
            .query(&[("db", self.database.as_str()), ("q", query.as_str())])
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SinkError::Response(format!("query returned {}", response.status())));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SinkError::Response(e.to_string()))?;
        Ok(parse_last_value(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn point(value: f64, timestamp_ms: u64) -> Point {
        Point {
            device_id: "greenhouse".into(),
            measurement: "temperature".into(),
            value,
            timestamp_ms,
        }
    }

    #[tokio::test]
    async fn test_memory_latest_within_window() {
        let sink = MemorySink::new();
        sink.write(&[point(21.0, now_ms() - 5_000), point(22.5, now_ms())]).await.unwrap();
        let latest = sink
            .read_latest("greenhouse", "temperature", Duration::from_secs(90))
            .await
            .unwrap();
        assert_eq!(latest, Some(22.5));
        assert_eq!(sink.history("greenhouse", "temperature"), vec![21.0, 22.5]);
    }

    #[tokio::test]
    async fn test_memory_stale_value_is_absent() {
        let sink = MemorySink::new();
        sink.write(&[point(22.5, now_ms() - 120_000)]).await.unwrap();
        let latest = sink
            .read_latest("greenhouse", "temperature", Duration::from_secs(90))
            .await
            .unwrap();
        assert_eq!(latest, None);
        assert_eq!(sink.read_latest("other", "temperature", Duration::from_secs(90)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_outage() {
        let sink = MemorySink::new();
        sink.set_failing(true);
        assert!(matches!(sink.write(&[point(1.0, 0)]).await, Err(SinkError::Transport(_))));
    }

    #[test]
    fn test_points_for_sample() {
        let sample = Sample {
            timestamp_ms: 42,
            values: BTreeMap::from([("humidity".to_string(), 40.0), ("temperature".to_string(), 21.0)]),
        };
        let points = points_for("gh", &sample);
        assert_eq!(points.len(), 2);
        assert!(points.iter().all(|p| p.timestamp_ms == 42 && p.device_id == "gh"));
    }

    #[test]
    fn test_line_protocol_escaping() {
        let p = Point {
            device_id: "green house".into(),
            measurement: "temp,c".into(),
            value: 21.5,
            timestamp_ms: 1_700_000_000_000,
        };
        assert_eq!(
            line_protocol(&[p]),
            "temp\\,c,device_id=green\\ house value=21.5 1700000000000"
        );
    }

    #[test]
    fn test_parse_influx_response() {
        let body = serde_json::json!({
            "results": [{ "series": [{ "columns": ["time", "last"], "values": [["2024-01-01T00:00:00Z", 31.5]] }] }]
        });
        assert_eq!(parse_last_value(&body), Some(31.5));
        assert_eq!(parse_last_value(&serde_json::json!({ "results": [{}] })), None);
    }

    #[test]
    fn test_influxql_window() {
        let q = influxql_latest("gh", "temperature", Duration::from_secs(90));
        assert!(q.contains("now() - 90s"));
        assert!(q.contains("device_id = 'gh'"));
    }
}
