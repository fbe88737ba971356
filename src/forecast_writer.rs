//! Maps a forecast batch onto the store's point model and writes it to the
//! weather bucket — a separate bucket from sensor data (see §3.3/§4.7).

use crate::error::AppError;
use crate::forecast::ForecastBatch;
use crate::store::{FieldValue, Point, SharedStoreClient};

pub struct ForecastWriter {
    store: SharedStoreClient,
    bucket: String,
}

impl ForecastWriter {
    pub fn new(store: SharedStoreClient, bucket: String) -> Self {
        Self { store, bucket }
    }

    pub async fn write_batch(&self, batch: &ForecastBatch) -> Result<usize, AppError> {
        let points = batch_to_points(batch);
        if points.is_empty() {
            return Ok(0);
        }
        let count = points.len();
        self.store.write_batched(&self.bucket, points).await?;
        Ok(count)
    }
}

fn batch_to_points(batch: &ForecastBatch) -> Vec<Point> {
    batch
        .records
        .iter()
        .filter_map(|record| {
            let mut point = Point::new("weather_forecasts", record.valid_at)
                .tag("location_lat", batch.location_lat.to_string())
                .tag("location_lon", batch.location_lon.to_string())
                .tag("timezone", batch.timezone.clone())
                .tag("retrieved_at", batch.retrieved_at.to_rfc3339())
                .tag("data_type", batch.data_type)
                .tag("is_forecast", batch.is_forecast.to_string());

            if let Some(v) = record.temperature_c {
                point = point.field("temperature_c", FieldValue::Float(v));
            }
            if let Some(v) = record.humidity_pct {
                point = point.field("humidity_pct", FieldValue::Float(v));
            }
            if let Some(v) = record.pressure_hpa {
                point = point.field("pressure_hpa", FieldValue::Float(v));
            }
            if let Some(v) = record.wind_speed {
                point = point.field("wind_speed", FieldValue::Float(v));
            }
            if let Some(v) = record.wind_dir {
                point = point.field("wind_dir", FieldValue::Float(v));
            }
            if let Some(v) = record.precipitation {
                point = point.field("precipitation", FieldValue::Float(v));
            }
            if let Some(v) = record.cloud_cover {
                point = point.field("cloud_cover", FieldValue::Float(v));
            }
            if let Some(v) = record.visibility {
                point = point.field("visibility", FieldValue::Float(v));
            }
            if let Some(v) = record.uv_index {
                point = point.field("uv_index", FieldValue::Float(v));
            }
            if let Some(v) = record.weather_code {
                point = point.field("weather_code", FieldValue::Int(v));
            }

            if point.is_empty() {
                None
            } else {
                Some(point)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::ForecastRecord;
    use chrono::Utc;

    #[test]
    fn empty_records_are_skipped() {
        let batch = ForecastBatch {
            location_lat: 1.0,
            location_lon: 2.0,
            timezone: "UTC".to_string(),
            retrieved_at: Utc::now(),
            is_forecast: true,
            data_type: "forecast",
            records: vec![ForecastRecord {
                valid_at: Utc::now(),
                ..Default::default()
            }],
        };
        assert!(batch_to_points(&batch).is_empty());
    }

    #[test]
    fn populated_record_becomes_one_point() {
        let batch = ForecastBatch {
            location_lat: 1.0,
            location_lon: 2.0,
            timezone: "UTC".to_string(),
            retrieved_at: Utc::now(),
            is_forecast: true,
            data_type: "forecast",
            records: vec![ForecastRecord {
                valid_at: Utc::now(),
                temperature_c: Some(20.0),
                ..Default::default()
            }],
        };
        let points = batch_to_points(&batch);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement, "weather_forecasts");
    }
}
