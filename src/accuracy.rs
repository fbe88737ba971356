//! Forecast-error join engine: aligns an hourly sensor series with an
//! hourly forecast series per configured horizon and emits signed/absolute
//! error records.

use crate::error::AppError;
use crate::store::{FieldValue, Point, QueryRecord, SharedStoreClient};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;

pub const FORECAST_HORIZONS_HOURS: [i64; 4] = [1, 6, 24, 48];
pub const ERROR_MEASUREMENT: &str = "weather_forecast_errors";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub forecast_horizon_hours: i64,
    pub temp_abs_error: Option<f64>,
    pub temp_signed_error: Option<f64>,
    pub pressure_abs_error: Option<f64>,
    pub pressure_signed_error: Option<f64>,
    pub humidity_abs_error: Option<f64>,
    pub humidity_signed_error: Option<f64>,
}

impl ErrorRecord {
    fn has_any_metric(&self) -> bool {
        self.temp_abs_error.is_some()
            || self.pressure_abs_error.is_some()
            || self.humidity_abs_error.is_some()
    }
}

/// Shifts the forecast series back by `horizon_hours` (so the index holding
/// a record represents what was forecast for `horizon_hours` later), then
/// inner-joins against the sensor series on exact hour-bucket timestamps,
/// matching `forecast_aligned.index = forecast_aligned.index - horizon`
/// from the source this was ported from.
pub fn align_and_compute_errors(
    sensor: &[QueryRecord],
    forecast: &[QueryRecord],
    horizon_hours: i64,
) -> Vec<ErrorRecord> {
    if sensor.is_empty() || forecast.is_empty() {
        return Vec::new();
    }

    let shift = ChronoDuration::hours(horizon_hours);
    let shifted_forecast: BTreeMap<DateTime<Utc>, &QueryRecord> = forecast
        .iter()
        .map(|record| (record.time - shift, record))
        .collect();

    let mut out = Vec::new();
    for actual in sensor {
        let Some(forecast_row) = shifted_forecast.get(&actual.time) else {
            continue;
        };

        let mut error = ErrorRecord {
            timestamp: actual.time,
            forecast_horizon_hours: horizon_hours,
            ..Default::default()
        };

        if let (Some(a), Some(f)) = (
            actual.fields.get("temperature_c"),
            forecast_row.fields.get("temperature_c"),
        ) {
            error.temp_abs_error = Some((a - f).abs());
            error.temp_signed_error = Some(f - a);
        }
        if let (Some(a), Some(f)) = (
            actual.fields.get("pressure_hpa"),
            forecast_row.fields.get("pressure_hpa"),
        ) {
            error.pressure_abs_error = Some((a - f).abs());
            error.pressure_signed_error = Some(f - a);
        }
        if let (Some(a), Some(f)) = (
            actual.fields.get("humidity_pct"),
            forecast_row.fields.get("humidity_pct"),
        ) {
            error.humidity_abs_error = Some((a - f).abs());
            error.humidity_signed_error = Some(f - a);
        }

        if error.has_any_metric() {
            out.push(error);
        }
    }

    out.sort_by_key(|e| e.timestamp);
    out
}

pub fn error_record_to_point(source: &str, record: &ErrorRecord) -> Point {
    let mut point = Point::new(ERROR_MEASUREMENT, record.timestamp)
        .tag("source", source)
        .tag("forecast_horizon_hours", record.forecast_horizon_hours.to_string());

    if let Some(v) = record.temp_abs_error {
        point = point.field("temp_abs_error", FieldValue::Float(v));
    }
    if let Some(v) = record.temp_signed_error {
        point = point.field("temp_signed_error", FieldValue::Float(v));
    }
    if let Some(v) = record.pressure_abs_error {
        point = point.field("pressure_abs_error", FieldValue::Float(v));
    }
    if let Some(v) = record.pressure_signed_error {
        point = point.field("pressure_signed_error", FieldValue::Float(v));
    }
    if let Some(v) = record.humidity_abs_error {
        point = point.field("humidity_abs_error", FieldValue::Float(v));
    }
    if let Some(v) = record.humidity_signed_error {
        point = point.field("humidity_signed_error", FieldValue::Float(v));
    }
    point
}

pub struct ErrorJoinEngine {
    store: SharedStoreClient,
    sensor_bucket: String,
    weather_bucket: String,
    source_label: String,
}

impl ErrorJoinEngine {
    pub fn new(
        store: SharedStoreClient,
        sensor_bucket: String,
        weather_bucket: String,
        source_label: String,
    ) -> Self {
        Self {
            store,
            sensor_bucket,
            weather_bucket,
            source_label,
        }
    }

    /// Runs the join for every configured horizon over `lookback` and
    /// writes the resulting error points. Returns the total error rows
    /// written. A horizon with no overlap contributes zero rows and is not
    /// an error.
    pub async fn run(&self, lookback: ChronoDuration) -> Result<usize, AppError> {
        let stop = Utc::now();
        let start = stop - lookback;

        let sensor = self
            .store
            .query(&hourly_mean_query(&self.sensor_bucket, "ruuvi_environmental", start, stop))
            .await?;
        let forecast = self
            .store
            .query(&hourly_mean_query(&self.weather_bucket, "weather_forecasts", start, stop))
            .await?;

        if sensor.is_empty() || forecast.is_empty() {
            tracing::warn!(
                sensor_rows = sensor.len(),
                forecast_rows = forecast.len(),
                "error join has no overlap on at least one side, skipping"
            );
            return Ok(0);
        }

        let mut total = 0;
        for horizon in FORECAST_HORIZONS_HOURS {
            let errors = align_and_compute_errors(&sensor, &forecast, horizon);
            if errors.is_empty() {
                continue;
            }
            let points: Vec<Point> = errors
                .iter()
                .map(|e| error_record_to_point(&self.source_label, e))
                .collect();
            total += points.len();
            self.store.write_batched(&self.weather_bucket, points).await?;
        }
        Ok(total)
    }
}

fn hourly_mean_query(bucket: &str, measurement: &str, start: DateTime<Utc>, stop: DateTime<Utc>) -> String {
    format!(
        r#"from(bucket: "{bucket}")
  |> range(start: {start}, stop: {stop})
  |> filter(fn: (r) => r._measurement == "{measurement}")
  |> aggregateWindow(every: 1h, fn: mean, createEmpty: false)
  |> pivot(rowKey: ["_time"], columnKey: ["_field"], valueColumn: "_value")"#,
        start = start.to_rfc3339(),
        stop = stop.to_rfc3339(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 27, h, 0, 0).unwrap()
    }

    fn record(h: u32, temp: f64) -> QueryRecord {
        let mut fields = BTreeMap::new();
        fields.insert("temperature_c".to_string(), temp);
        QueryRecord { time: hour(h), fields }
    }

    #[test]
    fn error_join_aligns_one_hour_horizon() {
        let sensor = vec![record(12, 20.0), record(13, 21.0), record(14, 22.0)];
        let forecast = vec![record(13, 19.5), record(14, 21.5), record(15, 22.5)];

        let errors = align_and_compute_errors(&sensor, &forecast, 1);

        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].timestamp, hour(12));
        assert_eq!(errors[0].temp_signed_error, Some(-0.5));
        assert_eq!(errors[1].temp_signed_error, Some(0.5));
        assert_eq!(errors[2].temp_signed_error, Some(0.5));
        for e in &errors {
            assert_eq!(e.temp_abs_error, e.temp_signed_error.map(f64::abs));
        }
    }

    #[test]
    fn join_with_zero_overlap_returns_empty() {
        let sensor = vec![record(12, 20.0)];
        let forecast = vec![record(20, 19.5)];
        let errors = align_and_compute_errors(&sensor, &forecast, 1);
        assert!(errors.is_empty());
    }

    #[test]
    fn empty_input_returns_empty_without_error() {
        assert!(align_and_compute_errors(&[], &[], 1).is_empty());
        assert!(align_and_compute_errors(&[record(12, 20.0)], &[], 1).is_empty());
    }
}
