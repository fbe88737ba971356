//! Driver-agnostic BLE scan source, backed by BlueZ via `bluer`.
//!
//! This module knows nothing about Ruuvi frame semantics; it only turns
//! adapter advertisement events into a plain `(address, rssi, manufacturer
//! data)` tuple stream. Ruuvi filtering happens in `decoder`.

use crate::error::AppError;
use bluer::{AdapterEvent, Address};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: Address,
    pub rssi: Option<i16>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

pub struct ScanSource {
    running: Arc<AtomicBool>,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl ScanSource {
    pub fn new(retry_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            retry_attempts,
            retry_delay,
        }
    }

    /// Opens the adapter (retrying on init failure) and returns a stream of
    /// advertisement events. Fails with `ScannerBusy` if a stream is already
    /// open; the caller must drop the previous stream (or call `stop`) first.
    pub async fn stream(
        &self,
        adapter_id: Option<&str>,
    ) -> Result<impl Stream<Item = Advertisement>, AppError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::ScannerBusy);
        }

        let adapter = match self.open_adapter_with_retry(adapter_id).await {
            Ok(adapter) => adapter,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        if let Err(err) = adapter.set_powered(true).await {
            self.running.store(false, Ordering::SeqCst);
            return Err(AppError::AdapterUnavailable(err.to_string()));
        }

        let events = match adapter.discover_devices().await {
            Ok(events) => events,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(AppError::AdapterUnavailable(err.to_string()));
            }
        };

        let running = self.running.clone();
        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    AdapterEvent::DeviceAdded(address) | AdapterEvent::DeviceChanged { address } => {
                        let device = adapter.device(address).ok()?;
                        let manufacturer_data = device
                            .manufacturer_data()
                            .await
                            .ok()
                            .flatten()
                            .unwrap_or_default();
                        let rssi = device.rssi().await.ok().flatten();
                        Some(Advertisement {
                            address,
                            rssi,
                            manufacturer_data,
                        })
                    }
                    _ => None,
                }
            }
        });

        // Keep `running` alive and flipped back to false once the stream is
        // dropped, so a subsequent `stream()` call is not rejected forever.
        struct Guard(Arc<AtomicBool>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.store(false, Ordering::SeqCst);
            }
        }
        let guard = Guard(running);
        let stream = stream.map(move |item| {
            let _keep_alive = &guard;
            item
        });

        Ok(stream)
    }

    async fn open_adapter_with_retry(
        &self,
        adapter_id: Option<&str>,
    ) -> Result<bluer::Adapter, AppError> {
        let mut attempt = 0;
        loop {
            let result = self.open_adapter(adapter_id).await;
            match result {
                Ok(adapter) => return Ok(adapter),
                Err(err) if attempt < self.retry_attempts => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %err, "BLE adapter init failed, retrying");
                    sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn open_adapter(&self, adapter_id: Option<&str>) -> Result<bluer::Adapter, AppError> {
        let session = bluer::Session::new()
            .await
            .map_err(|err| AppError::AdapterUnavailable(err.to_string()))?;
        match adapter_id {
            Some(name) => session
                .adapter(name)
                .map_err(|err| AppError::AdapterUnavailable(err.to_string())),
            None => {
                let names = session
                    .adapter_names()
                    .await
                    .map_err(|err| AppError::AdapterUnavailable(err.to_string()))?;
                let name = names
                    .into_iter()
                    .next()
                    .ok_or_else(|| AppError::AdapterUnavailable("no BLE adapter present".to_string()))?;
                session
                    .adapter(&name)
                    .map_err(|err| AppError::AdapterUnavailable(err.to_string()))
            }
        }
    }

    /// Idempotent stop: the next call to `stream` is allowed once any
    /// in-flight stream has been dropped. Swallows the case where nothing
    /// was running.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
