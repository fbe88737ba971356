//! Sensor pipeline: wires the scan source, decoder, dedup buffer and store
//! client together behind an explicit lifecycle, the way the teacher wires
//! its MQTT listener + batch worker behind `PipelineHandle`/`IngestStats`.

use crate::config::Config;
use crate::decoder::{self, Measurement};
use crate::dedup::DedupBuffer;
use crate::error::AppError;
use crate::scan::ScanSource;
use crate::store::{FieldValue, Point, SharedStoreClient};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::{interval, sleep};

/// Minimum gap between logged decode-rejection warnings; the per-frame
/// count keeps accumulating in `PipelineStats::decode_rejects` regardless.
const DECODE_REJECT_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Connecting,
    Running,
    Faulted,
    Draining,
}

/// Coalesced "last seen per sensor" sink. The full identity metadata store
/// lives outside this crate's scope; the pipeline only ever talks to it
/// through this narrow interface, and only once per statistics period.
pub trait IdentitySink: Send + Sync {
    fn record_seen(&self, mac: &str, at: DateTime<Utc>);
}

pub struct NullIdentitySink;
impl IdentitySink for NullIdentitySink {
    fn record_seen(&self, mac: &str, at: DateTime<Utc>) {
        tracing::trace!(sensor = mac, seen_at = %at, "sensor last-seen (no identity store configured)");
    }
}

pub struct PipelineStats {
    pub scan_cycles: AtomicU64,
    pub decode_rejects: AtomicU64,
    pub buffer_overflows: AtomicU64,
    pub points_written: AtomicU64,
    pub points_failed: AtomicU64,
    devices_seen: Mutex<HashSet<String>>,
    pub last_scan_at: Mutex<Option<DateTime<Utc>>>,
    pub last_write_at: Mutex<Option<DateTime<Utc>>>,
    pub last_error: Mutex<Option<String>>,
    decode_reject_logged_at: Mutex<Option<Instant>>,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self {
            scan_cycles: AtomicU64::new(0),
            decode_rejects: AtomicU64::new(0),
            buffer_overflows: AtomicU64::new(0),
            points_written: AtomicU64::new(0),
            points_failed: AtomicU64::new(0),
            devices_seen: Mutex::new(HashSet::new()),
            last_scan_at: Mutex::new(None),
            last_write_at: Mutex::new(None),
            last_error: Mutex::new(None),
            decode_reject_logged_at: Mutex::new(None),
        }
    }
}

impl PipelineStats {
    async fn note_device(&self, mac: &str) {
        let mut seen = self.devices_seen.lock().await;
        seen.insert(mac.to_string());
    }

    pub async fn distinct_devices(&self) -> usize {
        self.devices_seen.lock().await.len()
    }

    async fn note_error(&self, err: &AppError) {
        *self.last_error.lock().await = Some(err.to_string());
    }

    /// Records a decode rejection and returns the running total only when
    /// enough time has passed since the last logged one, so a noisy sensor
    /// produces one throttled warning instead of per-frame spam.
    async fn note_decode_reject(&self) -> Option<u64> {
        let total = self.decode_rejects.fetch_add(1, Ordering::Relaxed) + 1;
        let mut last_logged = self.decode_reject_logged_at.lock().await;
        let now = Instant::now();
        let should_log = match *last_logged {
            None => true,
            Some(at) => now.duration_since(at) >= DECODE_REJECT_LOG_INTERVAL,
        };
        if should_log {
            *last_logged = Some(now);
            Some(total)
        } else {
            None
        }
    }
}

pub struct SensorPipeline {
    scan: ScanSource,
    dedup: DedupBuffer,
    store: SharedStoreClient,
    bucket: String,
    adapter_id: Option<String>,
    flush_interval: std::time::Duration,
    identity_sink: Arc<dyn IdentitySink>,
    stats: Arc<PipelineStats>,
    state: Arc<Mutex<PipelineState>>,
    stop_requested: Arc<AtomicBool>,
}

const MAX_CONSECUTIVE_ERRORS_FOR_BACKOFF_CAP: u32 = 5;
const BACKOFF_BASE_SECS: u64 = 1;

impl SensorPipeline {
    pub fn new(config: &Config, store: SharedStoreClient) -> Self {
        Self {
            scan: ScanSource::new(config.retry_attempts, config.retry_delay()),
            dedup: DedupBuffer::new(config.max_buffer_size),
            store,
            bucket: config.store_bucket.clone(),
            adapter_id: config.adapter_id.clone(),
            flush_interval: config.flush_interval(),
            identity_sink: Arc::new(NullIdentitySink),
            stats: Arc::new(PipelineStats::default()),
            state: Arc::new(Mutex::new(PipelineState::Idle)),
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub async fn state(&self) -> PipelineState {
        *self.state.lock().await
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Drives the Idle -> Connecting -> Running -> (Faulted|Draining) -> Idle
    /// state machine until `request_stop` is called, or until an error ends
    /// the pipeline: `AppError::is_fatal` errors (a permanent store
    /// rejection, invalid config) and `AppError::ends_pipeline` errors (the
    /// BLE adapter itself is gone) both drain and return `Err` instead of
    /// backing off forever. The caller distinguishes the two: a fatal error
    /// should stop the whole process, an adapter failure ends only this
    /// task.
    pub async fn run(&self) -> Result<(), AppError> {
        let mut consecutive_errors: u32 = 0;

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                *self.state.lock().await = PipelineState::Draining;
                self.drain().await;
                *self.state.lock().await = PipelineState::Idle;
                return Ok(());
            }

            *self.state.lock().await = PipelineState::Connecting;
            if let Err(err) = self.store.connect().await {
                self.stats.note_error(&err).await;
                tracing::warn!(error = %err, "pipeline could not connect to store");
                if err.is_fatal() || err.ends_pipeline() {
                    *self.state.lock().await = PipelineState::Idle;
                    return Err(err);
                }
                self.fault_and_backoff(&mut consecutive_errors).await;
                continue;
            }

            *self.state.lock().await = PipelineState::Running;
            consecutive_errors = 0;

            match self.run_scan_and_flush_loop().await {
                Ok(()) => {
                    // stream ended cleanly (cancellation observed mid-loop)
                }
                Err(err) => {
                    self.stats.note_error(&err).await;
                    if err.is_fatal() || err.ends_pipeline() {
                        tracing::error!(error = %err, "pipeline ending: unrecoverable error");
                        self.drain().await;
                        *self.state.lock().await = PipelineState::Idle;
                        return Err(err);
                    }
                    tracing::error!(error = %err, "pipeline fault, entering backoff");
                    self.fault_and_backoff(&mut consecutive_errors).await;
                }
            }
        }
    }

    async fn fault_and_backoff(&self, consecutive_errors: &mut u32) {
        *self.state.lock().await = PipelineState::Faulted;
        *consecutive_errors += 1;
        let exponent = (*consecutive_errors).min(MAX_CONSECUTIVE_ERRORS_FOR_BACKOFF_CAP);
        let delay = std::time::Duration::from_secs(BACKOFF_BASE_SECS * 2u64.pow(exponent));
        tracing::warn!(delay_secs = delay.as_secs(), "backing off before reconnecting");
        sleep(delay).await;
    }

    async fn run_scan_and_flush_loop(&self) -> Result<(), AppError> {
        let mut stream = Box::pin(self.scan.stream(self.adapter_id.as_deref()).await?);
        let mut flush_ticker = interval(self.flush_interval);

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                self.scan.stop();
                return Ok(());
            }

            tokio::select! {
                maybe_adv = stream.next() => {
                    match maybe_adv {
                        Some(adv) => self.handle_advertisement(adv).await,
                        None => return Ok(()),
                    }
                }
                _ = flush_ticker.tick() => {
                    self.flush_to_store().await?;
                }
            }
        }
    }

    async fn handle_advertisement(&self, adv: crate::scan::Advertisement) {
        self.stats.scan_cycles.fetch_add(1, Ordering::Relaxed);
        *self.stats.last_scan_at.lock().await = Some(Utc::now());

        for (manufacturer_id, payload) in &adv.manufacturer_data {
            match decoder::decode(*manufacturer_id, payload, Utc::now()) {
                Ok(measurement) => {
                    let mac = format_adapter_mac(&adv.address);
                    let measurement = measurement.with_mac(mac.clone()).with_rssi(adv.rssi);
                    self.stats.note_device(&measurement.mac_address).await;
                    self.identity_sink
                        .record_seen(&measurement.mac_address, measurement.observed_at);
                    if self.dedup.insert(measurement).await {
                        self.stats.buffer_overflows.fetch_add(1, Ordering::Relaxed);
                        let err = AppError::BufferOverflow(format!(
                            "dedup buffer exceeded max_buffer_size while inserting {mac}"
                        ));
                        tracing::warn!(error = %err, "dedup buffer overflow, oldest sample discarded");
                    }
                }
                Err(rejection) => {
                    if let Some(total) = self.stats.note_decode_reject().await {
                        tracing::warn!(
                            reason = rejection.reason,
                            total_rejected = total,
                            "frame decode rejected (throttled)"
                        );
                    }
                }
            }
        }
    }

    async fn flush_to_store(&self) -> Result<(), AppError> {
        let measurements = self.dedup.drain().await;
        if measurements.is_empty() {
            return Ok(());
        }

        let mut points = Vec::new();
        for measurement in &measurements {
            points.extend(measurement_to_points(measurement));
        }
        let count = points.len() as u64;

        match self.store.write_batched(&self.bucket, points).await {
            Ok(()) => {
                self.stats.points_written.fetch_add(count, Ordering::Relaxed);
                *self.stats.last_write_at.lock().await = Some(Utc::now());
                Ok(())
            }
            Err(err) => {
                self.stats.points_failed.fetch_add(count, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    async fn drain(&self) {
        self.scan.stop();
        if let Err(err) = self.flush_to_store().await {
            tracing::warn!(error = %err, "final drain write failed, samples discarded");
        }
    }
}

fn format_adapter_mac(address: &bluer::Address) -> String {
    address.to_string().to_uppercase()
}

/// Splits one measurement into up to four physical-quantity points, per the
/// sensor bucket's measurement layout.
pub fn measurement_to_points(m: &Measurement) -> Vec<Point> {
    let format_tag = match m.format_tag {
        decoder::FormatTag::Format3 => "3",
        decoder::FormatTag::Format5 => "5",
    };

    let base = |name: &str| {
        Point::new(name, m.observed_at)
            .tag("sensor_mac", m.mac_address.clone())
            .tag("data_format", format_tag)
    };

    let mut points = Vec::new();

    let mut environmental = base("ruuvi_environmental");
    if let Some(v) = m.temperature_c {
        environmental = environmental.field("temperature_c", FieldValue::Float(v));
    }
    if let Some(v) = m.humidity_pct {
        environmental = environmental.field("humidity_pct", FieldValue::Float(v));
    }
    if let Some(v) = m.pressure_hpa {
        environmental = environmental.field("pressure_hpa", FieldValue::Float(v));
    }
    if !environmental.is_empty() {
        points.push(environmental);
    }

    let mut motion = base("ruuvi_motion");
    if let Some(v) = m.accel_x_g {
        motion = motion.field("accel_x_g", FieldValue::Float(v));
    }
    if let Some(v) = m.accel_y_g {
        motion = motion.field("accel_y_g", FieldValue::Float(v));
    }
    if let Some(v) = m.accel_z_g {
        motion = motion.field("accel_z_g", FieldValue::Float(v));
    }
    if let Some(v) = m.movement_counter {
        motion = motion.field("movement_counter", FieldValue::Int(v as i64));
    }
    if !motion.is_empty() {
        points.push(motion);
    }

    let mut power = base("ruuvi_power");
    if let Some(v) = m.battery_v {
        power = power.field("battery_voltage", FieldValue::Float(v));
    }
    if let Some(v) = m.tx_power_dbm {
        power = power.field("tx_power", FieldValue::Int(v as i64));
    }
    if !power.is_empty() {
        points.push(power);
    }

    let mut signal = base("ruuvi_signal");
    if let Some(v) = m.rssi_dbm {
        signal = signal.field("rssi", FieldValue::Int(v as i64));
    }
    if let Some(v) = m.sequence {
        signal = signal.field("measurement_sequence", FieldValue::Int(v as i64));
    }
    if !signal.is_empty() {
        points.push(signal);
    }

    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use decoder::FormatTag;

    fn sample() -> Measurement {
        Measurement {
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
            observed_at: Utc.with_ymd_and_hms(2026, 7, 27, 0, 0, 0).unwrap(),
            format_tag: FormatTag::Format5,
            temperature_c: Some(20.0),
            humidity_pct: Some(25.0),
            pressure_hpa: Some(600.0),
            accel_x_g: Some(1.0),
            accel_y_g: Some(-0.2),
            accel_z_g: Some(0.1),
            battery_v: Some(3.2),
            tx_power_dbm: Some(8),
            movement_counter: Some(42),
            sequence: Some(256),
            rssi_dbm: Some(-60),
            raw_bytes: Vec::new(),
        }
    }

    #[test]
    fn measurement_splits_into_four_points() {
        let points = measurement_to_points(&sample());
        let names: Vec<&str> = points.iter().map(|p| p.measurement.as_str()).collect();
        assert_eq!(
            names,
            vec!["ruuvi_environmental", "ruuvi_motion", "ruuvi_power", "ruuvi_signal"]
        );
    }

    #[test]
    fn empty_measurement_emits_no_points() {
        let mut m = sample();
        m.temperature_c = None;
        m.humidity_pct = None;
        m.pressure_hpa = None;
        m.accel_x_g = None;
        m.accel_y_g = None;
        m.accel_z_g = None;
        m.movement_counter = None;
        m.battery_v = None;
        m.tx_power_dbm = None;
        m.rssi_dbm = None;
        m.sequence = None;
        let points = measurement_to_points(&m);
        assert!(points.is_empty());
    }
}
