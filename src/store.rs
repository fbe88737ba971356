//! Time-series store client.
//!
//! Talks line-protocol writes and Flux queries over the InfluxDB v2 HTTP
//! API via `reqwest`, the same client crate the rest of this codebase uses
//! for outbound HTTP. Retry uses the `delay * base^attempt` backoff used
//! throughout this service for every retried operation.

use crate::error::AppError;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Bool(bool),
}

#[derive(Debug, Clone)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn to_line_protocol(&self) -> String {
        let mut line = escape_measurement(&self.measurement);
        for (k, v) in &self.tags {
            line.push(',');
            line.push_str(&escape_key(k));
            line.push('=');
            line.push_str(&escape_key(v));
        }
        line.push(' ');
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", escape_key(k), format_field(v)))
            .collect();
        line.push_str(&fields.join(","));
        line.push(' ');
        line.push_str(&self.timestamp.timestamp_nanos_opt().unwrap_or(0).to_string());
        line
    }
}

fn format_field(value: &FieldValue) -> String {
    match value {
        FieldValue::Float(f) => format!("{f}"),
        FieldValue::Int(i) => format!("{i}i"),
        FieldValue::Bool(b) => b.to_string(),
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(' ', "\\ ").replace(',', "\\,")
}

fn escape_key(s: &str) -> String {
    s.replace(' ', "\\ ").replace(',', "\\,").replace('=', "\\=")
}

#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub time: DateTime<Utc>,
    pub fields: BTreeMap<String, f64>,
}

struct BufferedPoint {
    bucket: String,
    point: Point,
}

pub struct StoreClient {
    endpoint: String,
    token: String,
    org: String,
    http: reqwest::Client,
    connected: AtomicBool,
    buffer: Mutex<VecDeque<BufferedPoint>>,
    batch_size: usize,
    max_buffer_size: usize,
    retry_attempts: u32,
    retry_delay: Duration,
    retry_base: f64,
}

impl StoreClient {
    pub fn new(
        endpoint: String,
        token: String,
        org: String,
        batch_size: usize,
        max_buffer_size: usize,
        retry_attempts: u32,
        retry_delay: Duration,
        retry_base: f64,
    ) -> Self {
        Self {
            endpoint,
            token,
            org,
            http: reqwest::Client::new(),
            connected: AtomicBool::new(false),
            buffer: Mutex::new(VecDeque::new()),
            batch_size,
            max_buffer_size,
            retry_attempts,
            retry_delay,
            retry_base,
        }
    }

    pub async fn connect(&self) -> Result<(), AppError> {
        let mut attempt = 0;
        loop {
            match self.health().await {
                Ok(()) => {
                    self.connected.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Err(err) if attempt < self.retry_attempts => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(attempt, error = %err, delay_secs = delay.as_secs_f64(), "store connect failed, retrying");
                    attempt += 1;
                    sleep(delay).await;
                }
                Err(err) => {
                    return Err(AppError::StoreUnreachable(err.to_string()));
                }
            }
        }
    }

    pub async fn health(&self) -> Result<(), AppError> {
        let url = format!("{}/health", self.endpoint.trim_end_matches('/'));
        let response = self.http.get(&url).send().await.map_err(AppError::from)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AppError::StoreUnreachable(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_secs_f64(self.retry_delay.as_secs_f64() * self.retry_base.powi(attempt as i32))
    }

    /// Writes a batch of points, retrying transient failures with backoff.
    /// A permanent failure (auth, schema) is reported as `StoreRejected` and
    /// never retried.
    pub async fn write(&self, bucket: &str, points: &[Point]) -> Result<(), AppError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AppError::NotConnected);
        }
        if points.is_empty() {
            return Ok(());
        }

        let body = points
            .iter()
            .map(Point::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n");

        let url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ns",
            self.endpoint.trim_end_matches('/'),
            self.org,
            bucket
        );

        let mut attempt = 0;
        loop {
            let response = self
                .http
                .post(&url)
                .header("Authorization", format!("Token {}", self.token))
                .header("Content-Type", "text/plain; charset=utf-8")
                .body(body.clone())
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if is_permanent_status(resp.status()) => {
                    let status = resp.status();
                    return Err(AppError::StoreRejected(format!(
                        "store rejected write with status {status}"
                    )));
                }
                Ok(resp) if attempt < self.retry_attempts => {
                    let status = resp.status();
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(attempt, %status, delay_secs = delay.as_secs_f64(), "store write failed, retrying");
                    attempt += 1;
                    sleep(delay).await;
                }
                Ok(resp) => {
                    return Err(AppError::StoreUnreachable(format!(
                        "store write exhausted retries with status {}",
                        resp.status()
                    )));
                }
                Err(err) if attempt < self.retry_attempts => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(attempt, error = %err, delay_secs = delay.as_secs_f64(), "store write failed, retrying");
                    attempt += 1;
                    sleep(delay).await;
                }
                Err(err) => return Err(AppError::StoreUnreachable(err.to_string())),
            }
        }
    }

    /// Runs a Flux query and returns records ordered by time. The
    /// implementation expects the CSV annotated-dialect response and pulls
    /// `_time` plus any numeric columns.
    pub async fn query(&self, flux: &str) -> Result<Vec<QueryRecord>, AppError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AppError::NotConnected);
        }

        let url = format!(
            "{}/api/v2/query?org={}",
            self.endpoint.trim_end_matches('/'),
            self.org
        );

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "application/vnd.flux")
            .header("Accept", "application/csv")
            .body(flux.to_string())
            .send()
            .await
            .map_err(AppError::from)?;

        if !response.status().is_success() {
            return Err(AppError::StoreUnreachable(format!(
                "query returned status {}",
                response.status()
            )));
        }

        let body = response.text().await.map_err(AppError::from)?;
        Ok(parse_flux_csv(&body))
    }

    /// Enqueues a point for later batched writing. Evicts the oldest
    /// buffered point if this push exceeds the ceiling.
    pub async fn buffer(&self, bucket: &str, point: Point) {
        let mut guard = self.buffer.lock().await;
        guard.push_back(BufferedPoint {
            bucket: bucket.to_string(),
            point,
        });
        while guard.len() > self.max_buffer_size {
            guard.pop_front();
            tracing::warn!("store buffer overflow, oldest point discarded");
        }
    }

    /// Writes up to `batch_size` buffered points per bucket. On a
    /// retryable failure for a bucket, its points are pushed back to the
    /// front of the buffer so they are retried on the next flush.
    pub async fn flush(&self) -> Result<(), AppError> {
        let mut guard = self.buffer.lock().await;
        if guard.is_empty() {
            return Ok(());
        }

        let mut by_bucket: BTreeMap<String, Vec<Point>> = BTreeMap::new();
        let mut taken = 0;
        while taken < self.batch_size {
            match guard.pop_front() {
                Some(buffered) => {
                    by_bucket.entry(buffered.bucket).or_default().push(buffered.point);
                    taken += 1;
                }
                None => break,
            }
        }
        drop(guard);

        let mut first_err = None;
        for (bucket, points) in by_bucket {
            match self.write(&bucket, &points).await {
                Ok(()) => {}
                Err(err) => {
                    if err.is_retryable() {
                        let mut guard = self.buffer.lock().await;
                        for point in points.into_iter().rev() {
                            guard.push_front(BufferedPoint {
                                bucket: bucket.clone(),
                                point,
                            });
                        }
                    }
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn buffered_len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Buffers every point then flushes until the buffer drains, so a
    /// caller's full point list is shipped through the `batch_size`-bounded
    /// write path instead of as one unbounded HTTP request. Stops and
    /// returns the error on the first failed flush, leaving whatever is
    /// still buffered (retryable points re-queued by `flush`) for the next
    /// flush cycle.
    pub async fn write_batched(&self, bucket: &str, points: Vec<Point>) -> Result<(), AppError> {
        if points.is_empty() {
            return Ok(());
        }
        for point in points {
            self.buffer(bucket, point).await;
        }
        while self.buffered_len().await > 0 {
            self.flush().await?;
        }
        Ok(())
    }
}

fn is_permanent_status(status: reqwest::StatusCode) -> bool {
    status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// Minimal annotated-CSV parser for the subset InfluxDB emits: a header row
/// of column names followed by data rows, ignoring `#`-prefixed annotation
/// rows and blank separator lines between tables.
fn parse_flux_csv(body: &str) -> Vec<QueryRecord> {
    let mut records = Vec::new();
    let mut header: Option<Vec<String>> = None;

    for line in body.lines() {
        if line.is_empty() || line.starts_with('#') {
            header = None;
            continue;
        }
        let columns: Vec<&str> = line.split(',').collect();
        if header.is_none() {
            header = Some(columns.iter().map(|c| c.to_string()).collect());
            continue;
        }
        let Some(cols) = &header else { continue };

        let mut time = None;
        let mut fields = BTreeMap::new();
        for (name, value) in cols.iter().zip(columns.iter()) {
            if name == "_time" {
                time = DateTime::parse_from_rfc3339(value)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc));
            } else if name == "_value" || !name.starts_with('_') {
                if let Ok(parsed) = value.parse::<f64>() {
                    fields.insert(name.clone(), parsed);
                }
            }
        }

        if let Some(time) = time {
            records.push(QueryRecord { time, fields });
        }
    }

    records.sort_by_key(|r| r.time);
    records
}

pub type SharedStoreClient = Arc<StoreClient>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn point_line_protocol_includes_tags_and_fields() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
        let point = Point::new("ruuvi_environmental", ts)
            .tag("sensor_mac", "AA:BB:CC:DD:EE:FF")
            .field("temperature_c", FieldValue::Float(20.0));
        let line = point.to_line_protocol();
        assert!(line.starts_with("ruuvi_environmental,sensor_mac=AA:BB:CC:DD:EE:FF "));
        assert!(line.contains("temperature_c=20"));
    }

    #[test]
    fn empty_point_has_no_fields() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
        let point = Point::new("x", ts);
        assert!(point.is_empty());
    }
}
