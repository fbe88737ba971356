//! Per-MAC "last observation wins" buffer.
//!
//! The high per-second advertisement rate is intentionally collapsed to the
//! coarser cadence of `flush_interval`: inserts are cheap and lock-protected,
//! while a flush atomically swaps the whole map out from under producers so
//! they never block on the drain to the store.

use crate::decoder::Measurement;
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct DedupBuffer {
    inner: Arc<Mutex<HashMap<String, Measurement>>>,
    max_buffer_size: usize,
}

impl DedupBuffer {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max_buffer_size,
        }
    }

    /// Inserts or overwrites the entry for this MAC. Returns `true` if the
    /// insert pushed the buffer over its ceiling and an eviction occurred.
    pub async fn insert(&self, measurement: Measurement) -> bool {
        let mut guard = self.inner.lock().await;
        guard.insert(measurement.mac_address.clone(), measurement);
        if guard.len() > self.max_buffer_size {
            let excess = guard.len() - self.max_buffer_size;
            let victims: Vec<String> = guard.keys().take(excess).cloned().collect();
            for mac in victims {
                guard.remove(&mac);
            }
            return true;
        }
        false
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Atomically swaps the current map out for an empty one and returns the
    /// drained contents, ready to be written to the store.
    pub async fn drain(&self) -> Vec<Measurement> {
        let mut guard = self.inner.lock().await;
        let drained = mem::take(&mut *guard);
        drained.into_values().collect()
    }
}

impl Clone for DedupBuffer {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            max_buffer_size: self.max_buffer_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::FormatTag;
    use chrono::{TimeZone, Utc};

    fn sample(mac: &str, temp: f64) -> Measurement {
        Measurement {
            mac_address: mac.to_string(),
            observed_at: Utc.with_ymd_and_hms(2026, 7, 27, 0, 0, 0).unwrap(),
            format_tag: FormatTag::Format5,
            temperature_c: Some(temp),
            humidity_pct: None,
            pressure_hpa: None,
            accel_x_g: None,
            accel_y_g: None,
            accel_z_g: None,
            battery_v: None,
            tx_power_dbm: None,
            movement_counter: None,
            sequence: None,
            rssi_dbm: None,
            raw_bytes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn dedup_last_writer_wins() {
        let buffer = DedupBuffer::new(100);
        buffer.insert(sample("AA:BB:CC:DD:EE:01", 20.0)).await;
        buffer.insert(sample("AA:BB:CC:DD:EE:01", 20.5)).await;
        buffer.insert(sample("AA:BB:CC:DD:EE:01", 21.0)).await;

        assert_eq!(buffer.len().await, 1);
        let drained = buffer.drain().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].temperature_c, Some(21.0));
    }

    #[tokio::test]
    async fn buffer_stays_within_ceiling() {
        let buffer = DedupBuffer::new(2);
        let mut overflowed = false;
        for i in 0..5 {
            overflowed |= buffer.insert(sample(&format!("AA:BB:CC:DD:EE:{i:02X}"), 20.0)).await;
        }
        assert!(overflowed);
        assert!(buffer.len().await <= 2);
    }

    #[tokio::test]
    async fn drain_empties_buffer() {
        let buffer = DedupBuffer::new(10);
        buffer.insert(sample("AA:BB:CC:DD:EE:01", 20.0)).await;
        let _ = buffer.drain().await;
        assert_eq!(buffer.len().await, 0);
    }
}
