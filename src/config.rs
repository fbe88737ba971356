use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub adapter_id: Option<String>,
    pub scan_duration_secs: u64,
    pub scan_interval_secs: u64,

    pub retry_attempts: u32,
    pub retry_delay_secs: f64,
    pub retry_base: f64,

    pub store_endpoint: String,
    pub store_token: String,
    pub store_org: String,
    pub store_bucket: String,
    pub weather_bucket: String,

    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_buffer_size: usize,

    pub forecast_endpoint: String,
    pub forecast_timeout_secs: u64,
    pub forecast_retry_attempts: u32,
    pub forecast_retry_delay_secs: f64,
    pub forecast_rate_limit_per_minute: u32,

    pub breaker_failure_threshold: u32,
    pub breaker_recovery_secs: u64,

    pub location_lat: f64,
    pub location_lon: f64,
    pub timezone: String,

    pub forecast_days: u32,
    pub historical_days: u32,
    pub forecast_interval_minutes: u64,

    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let store_endpoint = env::var("STORE_ENDPOINT")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .context("STORE_ENDPOINT is required")?;
        let store_token = env::var("STORE_TOKEN")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .context("STORE_TOKEN is required")?;
        let store_org = env::var("STORE_ORG")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .context("STORE_ORG is required")?;
        let store_bucket = env::var("STORE_BUCKET")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .context("STORE_BUCKET is required")?;
        let weather_bucket =
            env::var("WEATHER_BUCKET").unwrap_or_else(|_| "weather".to_string());

        let adapter_id = env::var("ADAPTER_ID")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty() && v != "auto");

        let scan_duration_secs = parse_env("SCAN_DURATION", 10);
        let scan_interval_secs = parse_env("SCAN_INTERVAL", 60);

        let retry_attempts = parse_env("RETRY_ATTEMPTS", 3);
        let retry_delay_secs = parse_env("RETRY_DELAY", 2.0);
        let retry_base = parse_env("RETRY_EXPONENTIAL_BASE", 2.0);

        let batch_size = parse_env("BATCH_SIZE", 100);
        let flush_interval_ms = parse_env("FLUSH_INTERVAL_MS", 10_000);
        let max_buffer_size = parse_env("MAX_BUFFER_SIZE", 10_000);

        let forecast_endpoint = env::var("FORECAST_ENDPOINT")
            .unwrap_or_else(|_| "https://api.open-meteo.com/v1".to_string());
        let forecast_timeout_secs = parse_env("FORECAST_TIMEOUT", 30);
        let forecast_retry_attempts = parse_env("FORECAST_RETRY_ATTEMPTS", 3);
        let forecast_retry_delay_secs = parse_env("FORECAST_RETRY_DELAY", 2.0);
        let forecast_rate_limit_per_minute = parse_env("FORECAST_RATE_LIMIT_PER_MINUTE", 10);

        let breaker_failure_threshold = parse_env("BREAKER_FAILURE_THRESHOLD", 5);
        let breaker_recovery_secs = parse_env("BREAKER_RECOVERY_SECONDS", 300);

        let location_lat = parse_env("LOCATION_LAT", 0.0);
        let location_lon = parse_env("LOCATION_LON", 0.0);
        let timezone = env::var("TIMEZONE").unwrap_or_else(|_| "UTC".to_string());

        let forecast_days = parse_env("FORECAST_DAYS", 7);
        let historical_days = parse_env("HISTORICAL_DAYS", 7);
        let forecast_interval_minutes = parse_env("FORECAST_INTERVAL_MINUTES", 60);

        let otlp_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();

        Ok(Self {
            adapter_id,
            scan_duration_secs,
            scan_interval_secs,
            retry_attempts,
            retry_delay_secs,
            retry_base,
            store_endpoint,
            store_token,
            store_org,
            store_bucket,
            weather_bucket,
            batch_size,
            flush_interval_ms,
            max_buffer_size,
            forecast_endpoint,
            forecast_timeout_secs,
            forecast_retry_attempts,
            forecast_retry_delay_secs,
            forecast_rate_limit_per_minute,
            breaker_failure_threshold,
            breaker_recovery_secs,
            location_lat,
            location_lon,
            timezone,
            forecast_days,
            historical_days,
            forecast_interval_minutes,
            otlp_endpoint,
        })
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs)
    }

    pub fn forecast_retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.forecast_retry_delay_secs)
    }

    pub fn breaker_recovery(&self) -> Duration {
        Duration::from_secs(self.breaker_recovery_secs)
    }

    pub fn forecast_interval(&self) -> Duration {
        Duration::from_secs(self.forecast_interval_minutes * 60)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    /// True when `other` differs in a setting the running components cannot
    /// pick up without being torn down and re-created.
    pub fn critical_diff(&self, other: &Config) -> bool {
        self.store_endpoint != other.store_endpoint
            || self.store_token != other.store_token
            || self.store_org != other.store_org
            || self.adapter_id != other.adapter_id
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
