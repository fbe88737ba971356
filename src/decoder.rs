//! Pure, stateless decoding of Ruuvi manufacturer-data frames.
//!
//! Nothing in this module touches the network, the clock (beyond stamping
//! `observed_at` at the call site), or any shared state. A malformed frame
//! is always a `None`/rejection, never a panic.

use chrono::{DateTime, Utc};

pub const RUUVI_MANUFACTURER_ID: u16 = 0x0499;

const FORMAT_3_TAG: u8 = 3;
const FORMAT_5_TAG: u8 = 5;
const FORMAT_3_MIN_LEN: usize = 14;
const FORMAT_5_MIN_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatTag {
    Format3,
    Format5,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub mac_address: String,
    pub observed_at: DateTime<Utc>,
    pub format_tag: FormatTag,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub accel_x_g: Option<f64>,
    pub accel_y_g: Option<f64>,
    pub accel_z_g: Option<f64>,
    pub battery_v: Option<f64>,
    pub tx_power_dbm: Option<i32>,
    pub movement_counter: Option<u8>,
    pub sequence: Option<u16>,
    pub rssi_dbm: Option<i16>,
    pub raw_bytes: Vec<u8>,
}

impl Measurement {
    /// Sets rssi only when the adapter actually reported one. `bluer`
    /// returns `Ok(None)` until it has cached a reading for the device;
    /// that must stay absent rather than become a fabricated `0`.
    pub fn with_rssi(mut self, rssi: Option<i16>) -> Self {
        if let Some(rssi) = rssi {
            self.rssi_dbm = Some(rssi);
        }
        self
    }

    pub fn with_mac(mut self, mac: String) -> Self {
        if self.mac_address.is_empty() {
            self.mac_address = mac;
        }
        self
    }
}

/// Rejects a payload that did not match a known Ruuvi frame. The reason is
/// for diagnostics only; callers must not treat it as a propagating error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeRejection {
    pub reason: &'static str,
}

pub type DecodeResult = Result<Measurement, DecodeRejection>;

/// Decode one manufacturer-data entry. `manufacturer_id` is the 16-bit
/// little-endian key BlueZ/the adapter reports for the AD structure;
/// `payload` is the bytes that follow it (tag byte first).
pub fn decode(manufacturer_id: u16, payload: &[u8], now: DateTime<Utc>) -> DecodeResult {
    if manufacturer_id != RUUVI_MANUFACTURER_ID {
        return Err(DecodeRejection {
            reason: "manufacturer_id is not Ruuvi",
        });
    }
    match payload.first() {
        Some(&FORMAT_3_TAG) => decode_format_3(payload, now),
        Some(&FORMAT_5_TAG) => decode_format_5(payload, now),
        Some(_) => Err(DecodeRejection {
            reason: "unknown data format tag",
        }),
        None => Err(DecodeRejection { reason: "empty payload" }),
    }
}

fn decode_format_3(payload: &[u8], now: DateTime<Utc>) -> DecodeResult {
    if payload.len() < FORMAT_3_MIN_LEN {
        return Err(DecodeRejection {
            reason: "format 3 payload shorter than 14 bytes",
        });
    }

    let humidity_pct = payload[1] as f64 * 0.5;
    let temp_int = payload[2] as i8 as f64;
    let temp_frac = payload[3] as f64 / 100.0;
    let temperature_c = temp_int + temp_frac;
    let pressure_raw = u16::from_be_bytes([payload[4], payload[5]]) as f64;
    let pressure_hpa = (pressure_raw + 50_000.0) / 100.0;
    let accel_x_g = i16::from_be_bytes([payload[6], payload[7]]) as f64 / 1000.0;
    let accel_y_g = i16::from_be_bytes([payload[8], payload[9]]) as f64 / 1000.0;
    let accel_z_g = i16::from_be_bytes([payload[10], payload[11]]) as f64 / 1000.0;
    let battery_v = u16::from_be_bytes([payload[12], payload[13]]) as f64 / 1000.0;

    Ok(Measurement {
        mac_address: String::new(),
        observed_at: now,
        format_tag: FormatTag::Format3,
        temperature_c: Some(temperature_c),
        humidity_pct: Some(humidity_pct),
        pressure_hpa: Some(pressure_hpa),
        accel_x_g: Some(accel_x_g),
        accel_y_g: Some(accel_y_g),
        accel_z_g: Some(accel_z_g),
        battery_v: Some(battery_v),
        tx_power_dbm: None,
        movement_counter: None,
        sequence: None,
        rssi_dbm: None,
        raw_bytes: payload.to_vec(),
    })
}

fn decode_format_5(payload: &[u8], now: DateTime<Utc>) -> DecodeResult {
    if payload.len() < FORMAT_5_MIN_LEN {
        return Err(DecodeRejection {
            reason: "format 5 payload shorter than 24 bytes",
        });
    }

    let temperature_c = i16::from_be_bytes([payload[1], payload[2]]) as f64 * 0.005;
    let humidity_pct = u16::from_be_bytes([payload[3], payload[4]]) as f64 * 0.0025;
    let pressure_raw = u16::from_be_bytes([payload[5], payload[6]]) as f64;
    let pressure_hpa = (pressure_raw + 50_000.0) / 100.0;
    let accel_x_g = i16::from_be_bytes([payload[7], payload[8]]) as f64 / 1000.0;
    let accel_y_g = i16::from_be_bytes([payload[9], payload[10]]) as f64 / 1000.0;
    let accel_z_g = i16::from_be_bytes([payload[11], payload[12]]) as f64 / 1000.0;

    let power_info = u16::from_be_bytes([payload[13], payload[14]]);
    let battery_v = ((power_info >> 5) as f64 + 1600.0) / 1000.0;
    let tx_power_dbm = (power_info & 0x1F) as i32 * 2 - 40;

    let movement_counter = payload[15];
    let sequence = u16::from_be_bytes([payload[16], payload[17]]);
    let mac_address = format_mac(&payload[18..24]);

    Ok(Measurement {
        mac_address,
        observed_at: now,
        format_tag: FormatTag::Format5,
        temperature_c: Some(temperature_c),
        humidity_pct: Some(humidity_pct),
        pressure_hpa: Some(pressure_hpa),
        accel_x_g: Some(accel_x_g),
        accel_y_g: Some(accel_y_g),
        accel_z_g: Some(accel_z_g),
        battery_v: Some(battery_v),
        tx_power_dbm: Some(tx_power_dbm),
        movement_counter: Some(movement_counter),
        sequence: Some(sequence),
        rssi_dbm: None,
        raw_bytes: payload.to_vec(),
    })
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 27, 0, 0, 0).unwrap()
    }

    #[test]
    fn format5_indoor_frame_decodes() {
        let payload = [
            0x05, 0x0F, 0xA0, 0x27, 0x10, 0x27, 0x10, 0x03, 0xE8, 0xFF, 0x38, 0x00, 0x64, 0xC8,
            0x18, 0x2A, 0x01, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF,
        ];
        let m = decode(RUUVI_MANUFACTURER_ID, &payload, ts()).expect("decodes");
        assert_eq!(m.format_tag, FormatTag::Format5);
        assert_eq!(m.temperature_c, Some(20.0));
        assert_eq!(m.humidity_pct, Some(25.0));
        assert_eq!(m.pressure_hpa, Some(600.00));
        assert_eq!(m.accel_x_g, Some(1.0));
        assert_eq!(m.accel_y_g, Some(-0.2));
        assert_eq!(m.accel_z_g, Some(0.1));
        assert_eq!(m.battery_v, Some(3.2));
        assert_eq!(m.tx_power_dbm, Some(8));
        assert_eq!(m.movement_counter, Some(42));
        assert_eq!(m.sequence, Some(256));
        assert_eq!(m.mac_address, "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn format3_cold_outdoor_frame_applies_documented_sign_bug() {
        let payload = [
            0x03, 0xA0, 0xF6, 0x19, 0x1E, 0x14, 0x00, 0x32, 0x00, 0x64, 0x03, 0xE8, 0x0A, 0x8C,
        ];
        let m = decode(RUUVI_MANUFACTURER_ID, &payload, ts()).expect("decodes");
        assert_eq!(m.humidity_pct, Some(80.0));
        assert_eq!(m.temperature_c, Some(-9.75));
        assert_eq!(m.pressure_hpa, Some(577.00));
        assert_eq!(m.battery_v, Some(2.7));
    }

    #[test]
    fn undersized_format3_payload_is_rejected_without_panicking() {
        let payload = [0x03, 0x32, 0x14];
        let result = decode(RUUVI_MANUFACTURER_ID, &payload, ts());
        assert!(result.is_err());
    }

    #[test]
    fn non_ruuvi_manufacturer_id_is_rejected() {
        let payload = [0x05u8; 24];
        let result = decode(0x004C, &payload, ts());
        assert_eq!(
            result.unwrap_err().reason,
            "manufacturer_id is not Ruuvi"
        );
    }

    #[test]
    fn temperature_tick_boundaries_round_trip() {
        let mut payload = vec![0x05u8; 24];
        payload[1..3].copy_from_slice(&(-32768i16).to_be_bytes());
        let m = decode(RUUVI_MANUFACTURER_ID, &payload, ts()).expect("decodes");
        assert_eq!(m.temperature_c, Some(-163.84));

        payload[1..3].copy_from_slice(&(32767i16).to_be_bytes());
        let m = decode(RUUVI_MANUFACTURER_ID, &payload, ts()).expect("decodes");
        assert_eq!(m.temperature_c, Some(163.835));
    }

    #[test]
    fn empty_payload_is_rejected() {
        let result = decode(RUUVI_MANUFACTURER_ID, &[], ts());
        assert_eq!(result.unwrap_err().reason, "empty payload");
    }

    #[test]
    fn with_rssi_none_leaves_field_absent() {
        let payload = [0x05u8; 24];
        let m = decode(RUUVI_MANUFACTURER_ID, &payload, ts())
            .expect("decodes")
            .with_rssi(None);
        assert_eq!(m.rssi_dbm, None);
    }

    #[test]
    fn with_rssi_some_sets_field() {
        let payload = [0x05u8; 24];
        let m = decode(RUUVI_MANUFACTURER_ID, &payload, ts())
            .expect("decodes")
            .with_rssi(Some(-72));
        assert_eq!(m.rssi_dbm, Some(-72));
    }
}
