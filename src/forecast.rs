//! Weather forecast fetcher: retrying HTTP client wrapped in a sliding
//! window rate limiter and a three-state circuit breaker.

use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Sliding-window rate limiter: at most `max_requests` calls to `acquire`
/// succeed in any trailing `window`-second interval; callers past the
/// limit wait for the oldest slot to age out.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Current occupancy of the sliding window after pruning expired
    /// timestamps, alongside the configured ceiling.
    pub async fn status(&self) -> (usize, u32) {
        let mut guard = self.timestamps.lock().await;
        let now = Instant::now();
        while let Some(&front) = guard.front() {
            if now.duration_since(front) > self.window {
                guard.pop_front();
            } else {
                break;
            }
        }
        (guard.len(), self.max_requests)
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut guard = self.timestamps.lock().await;
                let now = Instant::now();
                while let Some(&front) = guard.front() {
                    if now.duration_since(front) > self.window {
                        guard.pop_front();
                    } else {
                        break;
                    }
                }
                if guard.len() < self.max_requests as usize {
                    guard.push_back(now);
                    None
                } else {
                    let oldest = *guard.front().unwrap();
                    Some(self.window - now.duration_since(oldest))
                }
            };
            match wait {
                None => return,
                Some(duration) => sleep(duration.max(Duration::from_millis(50))).await,
            }
        }
    }
}

/// CLOSED -> OPEN after `failure_threshold` consecutive failures; after
/// `recovery_timeout` elapses, one probe call is let through as HALF_OPEN;
/// its success resets to CLOSED, its failure reopens the cooldown.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: Mutex<BreakerState>,
    failure_count: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            state: Mutex::new(BreakerState::Closed),
            failure_count: AtomicU32::new(0),
            opened_at: Mutex::new(None),
        }
    }

    pub async fn state(&self) -> BreakerState {
        *self.state.lock().await
    }

    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ToString,
    {
        {
            let mut state = self.state.lock().await;
            if *state == BreakerState::Open {
                let opened_at = *self.opened_at.lock().await;
                let cooled_down = opened_at
                    .map(|at| at.elapsed() > self.recovery_timeout)
                    .unwrap_or(false);
                if cooled_down {
                    *state = BreakerState::HalfOpen;
                } else {
                    return Err(AppError::UpstreamDown(
                        "circuit breaker open, call rejected".to_string(),
                    ));
                }
            }
        }

        match f().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(err) => {
                self.on_failure().await;
                Err(AppError::UpstreamDown(err.to_string()))
            }
        }
    }

    async fn on_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        *self.state.lock().await = BreakerState::Closed;
    }

    async fn on_failure(&self) {
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.failure_threshold {
            *self.state.lock().await = BreakerState::Open;
            *self.opened_at.lock().await = Some(Instant::now());
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ForecastRecord {
    pub valid_at: DateTime<Utc>,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_dir: Option<f64>,
    pub precipitation: Option<f64>,
    pub cloud_cover: Option<f64>,
    pub visibility: Option<f64>,
    pub uv_index: Option<f64>,
    pub weather_code: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ForecastBatch {
    pub location_lat: f64,
    pub location_lon: f64,
    pub timezone: String,
    pub retrieved_at: DateTime<Utc>,
    pub is_forecast: bool,
    pub data_type: &'static str,
    pub records: Vec<ForecastRecord>,
}

pub struct ForecastFetcher {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
    rate_limiter: RateLimiter,
    breaker: CircuitBreaker,
}

impl ForecastFetcher {
    pub fn new(
        endpoint: String,
        timeout: Duration,
        retry_attempts: u32,
        retry_delay: Duration,
        max_requests_per_minute: u32,
        breaker_failure_threshold: u32,
        breaker_recovery: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            endpoint,
            timeout,
            retry_attempts,
            retry_delay,
            rate_limiter: RateLimiter::new(max_requests_per_minute, Duration::from_secs(60)),
            breaker: CircuitBreaker::new(breaker_failure_threshold, breaker_recovery),
        }
    }

    pub async fn breaker_state(&self) -> BreakerState {
        self.breaker.state().await
    }

    /// Current (occupied, max) slots in the rate limiter's trailing window.
    pub async fn rate_limiter_status(&self) -> (usize, u32) {
        self.rate_limiter.status().await
    }

    pub async fn fetch_forecast(
        &self,
        lat: f64,
        lon: f64,
        timezone: &str,
        days: u32,
    ) -> Result<ForecastBatch, AppError> {
        let url = format!(
            "{}/forecast?latitude={lat}&longitude={lon}&timezone={tz}&forecast_days={days}&hourly={fields}",
            self.endpoint.trim_end_matches('/'),
            tz = timezone,
            fields = HOURLY_FIELDS,
        );
        let retrieved_at = Utc::now();
        let body = self.get_with_safeties(&url).await?;
        let records = parse_hourly(&body)?;
        Ok(ForecastBatch {
            location_lat: lat,
            location_lon: lon,
            timezone: timezone.to_string(),
            retrieved_at,
            is_forecast: true,
            data_type: "forecast",
            records,
        })
    }

    pub async fn fetch_historical(
        &self,
        lat: f64,
        lon: f64,
        timezone: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ForecastBatch, AppError> {
        let url = format!(
            "{}/historical-weather-api?latitude={lat}&longitude={lon}&timezone={tz}&start_date={start}&end_date={end}&hourly={fields}",
            self.endpoint.trim_end_matches('/'),
            tz = timezone,
            start = start.format("%Y-%m-%d"),
            end = end.format("%Y-%m-%d"),
            fields = HOURLY_FIELDS,
        );
        let retrieved_at = Utc::now();
        let body = self.get_with_safeties(&url).await?;
        let records = parse_hourly(&body)?;
        Ok(ForecastBatch {
            location_lat: lat,
            location_lon: lon,
            timezone: timezone.to_string(),
            retrieved_at,
            is_forecast: false,
            data_type: "historical",
            records,
        })
    }

    async fn get_with_safeties(&self, url: &str) -> Result<String, AppError> {
        self.rate_limiter.acquire().await;
        let url = url.to_string();
        self.breaker
            .call(|| async move { self.request_with_retry(&url).await })
            .await
    }

    async fn request_with_retry(&self, url: &str) -> Result<String, AppError> {
        let mut attempt = 0;
        loop {
            let response = self.http.get(url).timeout(self.timeout).send().await;
            match response {
                Ok(resp) if resp.status().is_success() => {
                    return resp.text().await.map_err(AppError::from);
                }
                Ok(resp) if is_retryable_status(resp.status()) && attempt < self.retry_attempts => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(status = %resp.status(), attempt, "forecast fetch failed, retrying");
                    attempt += 1;
                    sleep(delay).await;
                }
                Ok(resp) => {
                    return Err(AppError::UpstreamDown(format!(
                        "forecast provider returned {}",
                        resp.status()
                    )));
                }
                Err(err) if attempt < self.retry_attempts => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(error = %err, attempt, "forecast fetch failed, retrying");
                    attempt += 1;
                    sleep(delay).await;
                }
                Err(err) => return Err(AppError::from(err)),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.retry_delay * 2u32.pow(attempt.min(6))
    }
}

const HOURLY_FIELDS: &str = "temperature_2m,relativehumidity_2m,surface_pressure,windspeed_10m,winddirection_10m,precipitation,cloudcover,visibility,uv_index,weathercode";

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn parse_hourly(body: &str) -> Result<Vec<ForecastRecord>, AppError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| AppError::UpstreamDown(format!("invalid forecast JSON: {err}")))?;
    let hourly = value
        .get("hourly")
        .ok_or_else(|| AppError::UpstreamDown("forecast response missing hourly block".to_string()))?;

    let times = string_array(hourly, "time");
    let temperature = number_array(hourly, "temperature_2m");
    let humidity = number_array(hourly, "relativehumidity_2m");
    let pressure = number_array(hourly, "surface_pressure");
    let wind_speed = number_array(hourly, "windspeed_10m");
    let wind_dir = number_array(hourly, "winddirection_10m");
    let precipitation = number_array(hourly, "precipitation");
    let cloud_cover = number_array(hourly, "cloudcover");
    let visibility = number_array(hourly, "visibility");
    let uv_index = number_array(hourly, "uv_index");
    let weather_code = number_array(hourly, "weathercode");

    let mut records = Vec::with_capacity(times.len());
    for (i, time) in times.iter().enumerate() {
        let Some(valid_at) = parse_hourly_timestamp(time) else {
            continue;
        };
        records.push(ForecastRecord {
            valid_at,
            temperature_c: safe_get(&temperature, i),
            humidity_pct: safe_get(&humidity, i),
            pressure_hpa: safe_get(&pressure, i),
            wind_speed: safe_get(&wind_speed, i),
            wind_dir: safe_get(&wind_dir, i),
            precipitation: safe_get(&precipitation, i),
            cloud_cover: safe_get(&cloud_cover, i),
            visibility: safe_get(&visibility, i),
            uv_index: safe_get(&uv_index, i),
            weather_code: safe_get(&weather_code, i).map(|v| v as i64),
        });
    }
    Ok(records)
}

fn string_array(hourly: &Value, key: &str) -> Vec<String> {
    hourly
        .get(key)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn number_array(hourly: &Value, key: &str) -> Vec<Option<f64>> {
    hourly
        .get(key)
        .and_then(Value::as_array)
        .map(|arr| arr.iter().map(|v| v.as_f64()).collect())
        .unwrap_or_default()
}

/// Index-aligned, out-of-range-safe accessor mirroring the provider's own
/// "hourly arrays parallel to the time list" contract: a short or missing
/// array yields `None` rather than panicking.
fn safe_get(values: &[Option<f64>], index: usize) -> Option<f64> {
    values.get(index).copied().flatten()
}

fn parse_hourly_timestamp(s: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M")
        .ok()
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn circuit_breaker_trips_and_recovers() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(50));
        for _ in 0..3 {
            let _ = breaker
                .call(|| async { Err::<(), _>("boom") })
                .await;
        }
        assert_eq!(breaker.state().await, BreakerState::Open);

        let rejected = breaker.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(rejected.is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let recovered = breaker.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(recovered.is_ok());
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn rate_limiter_allows_burst_up_to_max() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(limiter.timestamps.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn rate_limiter_status_reports_occupancy_and_ceiling() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert_eq!(limiter.status().await, (0, 3));
        limiter.acquire().await;
        assert_eq!(limiter.status().await, (1, 3));
    }

    #[tokio::test]
    async fn rate_limiter_status_prunes_expired_slots() {
        let limiter = RateLimiter::new(2, Duration::from_millis(30));
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(limiter.status().await, (0, 2));
    }

    #[test]
    fn safe_get_handles_short_arrays() {
        let values = vec![Some(1.0), Some(2.0)];
        assert_eq!(safe_get(&values, 0), Some(1.0));
        assert_eq!(safe_get(&values, 5), None);
    }
}
