//! Periodic fetch -> store -> join -> analyze loop driving the forecast
//! side of the system, with per-step error isolation and signal-driven
//! graceful shutdown / config reload.

use crate::accuracy::ErrorJoinEngine;
use crate::config::Config;
use crate::forecast::ForecastFetcher;
use crate::forecast_writer::ForecastWriter;
use crate::store::SharedStoreClient;
use chrono::Duration as ChronoDuration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

const SHUTDOWN_POLL_SLICE: Duration = Duration::from_secs(5);

pub struct Orchestrator {
    config: Mutex<Config>,
    store: SharedStoreClient,
    fetcher: Mutex<ForecastFetcher>,
    writer: ForecastWriter,
    join_engine: ErrorJoinEngine,
    shutdown: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: Config, store: SharedStoreClient) -> Self {
        let fetcher = build_fetcher(&config);
        let writer = ForecastWriter::new(store.clone(), config.weather_bucket.clone());
        let join_engine = ErrorJoinEngine::new(
            store.clone(),
            config.store_bucket.clone(),
            config.weather_bucket.clone(),
            "ruuvi-sidecar".to_string(),
        );
        Self {
            config: Mutex::new(config),
            store,
            fetcher: Mutex::new(fetcher),
            writer,
            join_engine,
            shutdown: Arc::new(AtomicBool::new(false)),
            reload: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn reload_handle(&self) -> Arc<AtomicBool> {
        self.reload.clone()
    }

    pub async fn run(&self) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                tracing::info!("orchestrator observed shutdown signal, exiting");
                return;
            }

            if self.reload.swap(false, Ordering::SeqCst) {
                self.apply_reload().await;
            }

            self.run_cycle().await;

            let interval = self.config.lock().await.forecast_interval();
            if !self.sleep_observing_shutdown(interval).await {
                return;
            }
        }
    }

    async fn run_cycle(&self) {
        let (lat, lon, timezone, days, bucket_lookback_hours) = {
            let config = self.config.lock().await;
            (
                config.location_lat,
                config.location_lon,
                config.timezone.clone(),
                config.forecast_days,
                config.historical_days as i64 * 24,
            )
        };

        let batch = {
            let fetcher = self.fetcher.lock().await;
            fetcher.fetch_forecast(lat, lon, &timezone, days).await
        };

        match batch {
            Ok(batch) => match self.writer.write_batch(&batch).await {
                Ok(written) => tracing::info!(written, "forecast batch written"),
                Err(err) => tracing::error!(error = %err, "forecast write step failed"),
            },
            Err(err) => {
                tracing::error!(error = %err, "forecast fetch step failed, continuing to join step");
            }
        }

        // The join step runs regardless of whether today's fetch succeeded;
        // prior data already in the store may still be joinable.
        match self
            .join_engine
            .run(ChronoDuration::hours(bucket_lookback_hours))
            .await
        {
            Ok(written) => tracing::info!(written, "error join step complete"),
            Err(err) => tracing::error!(error = %err, "error join step failed"),
        }
    }

    async fn apply_reload(&self) {
        let new_config = match Config::from_env() {
            Ok(c) => c,
            Err(err) => {
                tracing::error!(error = %err, "config reload failed, keeping current configuration");
                return;
            }
        };

        let mut config = self.config.lock().await;
        if config.critical_diff(&new_config) {
            tracing::info!("critical configuration changed, rebuilding forecast fetcher");
            *self.fetcher.lock().await = build_fetcher(&new_config);
            if let Err(err) = self.store.connect().await {
                tracing::error!(error = %err, "store reconnect after reload failed");
            }
        }
        *config = new_config;
    }

    /// Sleeps in short slices so a shutdown request is observed within
    /// `SHUTDOWN_POLL_SLICE`. Returns `false` if shutdown was observed.
    async fn sleep_observing_shutdown(&self, total: Duration) -> bool {
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            let slice = remaining.min(SHUTDOWN_POLL_SLICE);
            sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
        }
        !self.shutdown.load(Ordering::SeqCst)
    }
}

fn build_fetcher(config: &Config) -> ForecastFetcher {
    ForecastFetcher::new(
        config.forecast_endpoint.clone(),
        Duration::from_secs(config.forecast_timeout_secs),
        config.forecast_retry_attempts,
        config.forecast_retry_delay(),
        config.forecast_rate_limit_per_minute,
        config.breaker_failure_threshold,
        config.breaker_recovery(),
    )
}
