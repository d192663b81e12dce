//! Per-record enrichment. Every function here is pure; batches are split across
//! rayon workers and the partial results concatenated.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike};
use rayon::prelude::*;
use thiserror::Error;

use crate::error::{TransformError, ValidationError};
use crate::grid;
use crate::models::{
    AltitudeBand, BatteryBand, ClassifiedRecord, NetworkGeneration, Period, RawRecord, SignalBand,
    SpeedBand,
};

pub const NO_SIGNAL: &str = "NO_SIGNAL";

const MPS_TO_KMH: f64 = 3.6;

/// Upper bounds, checked in order; the last band is the fallback.
const ALTITUDE_RULES: &[(f64, AltitudeBand)] = &[(400.0, AltitudeBand::Low), (500.0, AltitudeBand::Mid)];

/// Exclusive upper bounds, checked in order.
const BATTERY_RULES: &[(f64, BatteryBand)] = &[
    (25.0, BatteryBand::Critical),
    (50.0, BatteryBand::Low),
    (75.0, BatteryBand::Medium),
];

/// Inclusive lower bounds in dBm, checked in order.
const SIGNAL_RULES: &[(f64, SignalBand)] = &[
    (-60.0, SignalBand::Excellent),
    (-70.0, SignalBand::Good),
    (-80.0, SignalBand::Fair),
];

/// Inclusive upper bounds in km/h, checked in order after the stopped check.
const SPEED_RULES: &[(f64, SpeedBand)] = &[
    (5.0, SpeedBand::Walking),
    (10.0, SpeedBand::Running),
    (60.0, SpeedBand::PublicTransport),
];

const NETWORK_RULES: &[(&[&str], NetworkGeneration)] = &[
    (&["WIFI", "WLAN"], NetworkGeneration::Wifi),
    (&["5G", "NR"], NetworkGeneration::G5),
    (&["4G", "LTE"], NetworkGeneration::G4),
    (&["3G", "HSDPA", "HSUPA", "HSPA", "UMTS", "WCDMA"], NetworkGeneration::G3),
    (&["2G", "EDGE", "GPRS", "GSM"], NetworkGeneration::G2),
];

const NO_SIGNAL_VALUES: &[&str] = &[
    "UNKNOWN",
    "SIN SEÑAL",
    "SIN SENAL",
    "SIN SEAL",
    "NO SIGNAL",
    "NO SERVICE",
    "N/A",
    "NA",
    "NONE",
    "NULL",
];

const CARRIER_RULES: &[(&[&str], &str)] = &[
    (
        &[
            "ENTEL",
            "BOMOV",
            "+18VACUNATE",
            "LADISTANCIANOSCUIDA",
            "MOVIL GSM",
            "T-MOBILE",
        ],
        "ENTEL",
    ),
    (&["TIGO"], "TIGO"),
    (&["VIVA"], "VIVA"),
    (&["SIN SE", "SEAL"], NO_SIGNAL),
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Malformed(#[from] TransformError),
}

/// Output of classifying one extracted batch.
#[derive(Debug, Default)]
pub struct ClassifiedBatch {
    pub records: Vec<ClassifiedRecord>,
    /// Dropped by the coordinate validity filter.
    pub filtered: usize,
    /// Dropped because a field could not be parsed.
    pub malformed: usize,
}

impl ClassifiedBatch {
    fn absorb(mut self, other: ClassifiedBatch) -> Self {
        self.records.extend(other.records);
        self.filtered += other.filtered;
        self.malformed += other.malformed;
        self
    }
}

pub fn period(hour: u32) -> Period {
    match hour {
        6..=11 => Period::Morning,
        12..=18 => Period::Afternoon,
        _ => Period::Night,
    }
}

pub fn altitude_band(altitude: Option<f64>) -> Option<AltitudeBand> {
    let altitude = altitude?;
    Some(
        ALTITUDE_RULES
            .iter()
            .find(|(limit, _)| altitude <= *limit)
            .map(|(_, band)| *band)
            .unwrap_or(AltitudeBand::High),
    )
}

pub fn battery_band(battery: Option<f64>) -> Option<BatteryBand> {
    let battery = battery?;
    Some(
        BATTERY_RULES
            .iter()
            .find(|(limit, _)| battery < *limit)
            .map(|(_, band)| *band)
            .unwrap_or(BatteryBand::High),
    )
}

pub fn signal_band(signal: Option<f64>) -> Option<SignalBand> {
    let signal = signal?;
    Some(
        SIGNAL_RULES
            .iter()
            .find(|(floor, _)| signal >= *floor)
            .map(|(_, band)| *band)
            .unwrap_or(SignalBand::Poor),
    )
}

/// Speed band from metres per second.
pub fn speed_band(speed_mps: Option<f64>) -> SpeedBand {
    match speed_mps {
        None => SpeedBand::Stopped,
        Some(mps) => speed_band_kmh(mps * MPS_TO_KMH),
    }
}

pub fn speed_band_kmh(kmh: f64) -> SpeedBand {
    if kmh <= 0.0 {
        return SpeedBand::Stopped;
    }
    SPEED_RULES
        .iter()
        .find(|(limit, _)| kmh <= *limit)
        .map(|(_, band)| *band)
        .unwrap_or(SpeedBand::Vehicle)
}

pub fn network_generation(network_type: Option<&str>) -> NetworkGeneration {
    let Some(raw) = network_type else {
        return NetworkGeneration::Unknown;
    };
    let compact: String = raw
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' ' | '.'))
        .flat_map(char::to_uppercase)
        .collect();
    if compact.is_empty() {
        return NetworkGeneration::Unknown;
    }
    NETWORK_RULES
        .iter()
        .find(|(fragments, _)| fragments.iter().any(|f| matches_fragment(&compact, f)))
        .map(|(_, generation)| *generation)
        .unwrap_or(NetworkGeneration::Unknown)
}

// "NR" is too short to match as a substring.
fn matches_fragment(compact: &str, fragment: &str) -> bool {
    if fragment.len() <= 2 && fragment.chars().all(|c| c.is_ascii_alphabetic()) {
        compact == fragment
    } else {
        compact.contains(fragment)
    }
}

pub fn normalize_operator(operator: Option<&str>) -> String {
    let Some(raw) = operator.map(str::trim).filter(|s| !s.is_empty()) else {
        return NO_SIGNAL.to_string();
    };
    let upper = raw.to_uppercase();
    if NO_SIGNAL_VALUES.contains(&upper.as_str()) {
        return NO_SIGNAL.to_string();
    }
    CARRIER_RULES
        .iter()
        .find(|(fragments, _)| fragments.iter().any(|f| upper.contains(f)))
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(upper)
}

/// Accepts RFC 3339 (local wall-clock time is kept) or a bare `YYYY-MM-DD[ T]HH:MM:SS[.f]`.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_local());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt);
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(value, format) {
            return Some(dt.naive_local());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

pub fn validate_coordinates(raw: &RawRecord) -> Result<(f64, f64), ValidationError> {
    let (Some(latitude), Some(longitude)) = (raw.latitude, raw.longitude) else {
        return Err(ValidationError::MissingCoordinate { id: raw.id });
    };
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(ValidationError::LatitudeOutOfRange {
            id: raw.id,
            value: latitude,
        });
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return Err(ValidationError::LongitudeOutOfRange {
            id: raw.id,
            value: longitude,
        });
    }
    Ok((latitude, longitude))
}

pub fn classify(raw: RawRecord, cell_size: f64) -> Result<ClassifiedRecord, Rejection> {
    let (latitude, longitude) = validate_coordinates(&raw)?;
    let recorded_at = raw
        .timestamp
        .as_deref()
        .and_then(parse_timestamp)
        .ok_or_else(|| TransformError::Timestamp {
            id: raw.id,
            value: raw.timestamp.clone().unwrap_or_default(),
        })?;

    Ok(ClassifiedRecord {
        period: period(recorded_at.hour()),
        altitude_band: altitude_band(raw.altitude),
        battery_band: battery_band(raw.battery),
        signal_band: signal_band(raw.signal),
        speed_band: speed_band(raw.speed),
        network_generation: network_generation(raw.network_type.as_deref()),
        operator_normalized: normalize_operator(raw.operator.as_deref()),
        grid_lat: grid::cell_origin(latitude, cell_size),
        grid_lon: grid::cell_origin(longitude, cell_size),
        id: raw.id,
        device_id: raw.device_id,
        device_name: raw.device_name,
        latitude,
        longitude,
        altitude: raw.altitude,
        speed: raw.speed,
        battery: raw.battery,
        signal: raw.signal,
        operator: raw.operator,
        network_type: raw.network_type,
        recorded_at,
        district_id: None,
        province_id: None,
    })
}

fn classify_one(mut batch: ClassifiedBatch, raw: RawRecord, cell_size: f64) -> ClassifiedBatch {
    match classify(raw, cell_size) {
        Ok(record) => batch.records.push(record),
        Err(Rejection::Invalid(reason)) => {
            tracing::debug!(%reason, "record filtered");
            batch.filtered += 1;
        }
        Err(Rejection::Malformed(reason)) => {
            tracing::warn!(%reason, "record dropped");
            batch.malformed += 1;
        }
    }
    batch
}

/// Classifies a batch in partitions of at least `partition_size` records.
pub fn classify_batch(
    records: Vec<RawRecord>,
    cell_size: f64,
    partition_size: usize,
) -> ClassifiedBatch {
    records
        .into_par_iter()
        .with_min_len(partition_size.max(1))
        .fold(ClassifiedBatch::default, |batch, raw| {
            classify_one(batch, raw, cell_size)
        })
        .reduce(ClassifiedBatch::default, ClassifiedBatch::absorb)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: i64, latitude: f64, longitude: f64) -> RawRecord {
        RawRecord {
            id,
            device_id: format!("dev-{}", id % 3),
            device_name: Some("Pixel".to_string()),
            latitude: Some(latitude),
            longitude: Some(longitude),
            altitude: Some(420.0),
            speed: Some(0.0),
            battery: Some(80.0),
            signal: Some(-65.0),
            operator: Some("Entel S.A.".to_string()),
            network_type: Some("LTE".to_string()),
            timestamp: Some("2024-05-01T13:30:00".to_string()),
        }
    }

    #[test]
    fn period_boundaries() {
        assert_eq!(period(5), Period::Night);
        assert_eq!(period(6), Period::Morning);
        assert_eq!(period(11), Period::Morning);
        assert_eq!(period(12), Period::Afternoon);
        assert_eq!(period(18), Period::Afternoon);
        assert_eq!(period(19), Period::Night);
        assert_eq!(period(0), Period::Night);
    }

    #[test]
    fn altitude_boundaries() {
        assert_eq!(altitude_band(None), None);
        assert_eq!(altitude_band(Some(400.0)), Some(AltitudeBand::Low));
        assert_eq!(altitude_band(Some(400.5)), Some(AltitudeBand::Mid));
        assert_eq!(altitude_band(Some(500.0)), Some(AltitudeBand::Mid));
        assert_eq!(altitude_band(Some(500.01)), Some(AltitudeBand::High));
    }

    #[test]
    fn battery_boundaries() {
        assert_eq!(battery_band(None), None);
        assert_eq!(battery_band(Some(24.999)), Some(BatteryBand::Critical));
        assert_eq!(battery_band(Some(25.0)), Some(BatteryBand::Low));
        assert_eq!(battery_band(Some(49.9)), Some(BatteryBand::Low));
        assert_eq!(battery_band(Some(50.0)), Some(BatteryBand::Medium));
        assert_eq!(battery_band(Some(75.0)), Some(BatteryBand::High));
        assert_eq!(battery_band(Some(100.0)), Some(BatteryBand::High));
    }

    #[test]
    fn signal_boundaries() {
        assert_eq!(signal_band(None), None);
        assert_eq!(signal_band(Some(-60.0)), Some(SignalBand::Excellent));
        assert_eq!(signal_band(Some(-60.5)), Some(SignalBand::Good));
        assert_eq!(signal_band(Some(-70.0)), Some(SignalBand::Good));
        assert_eq!(signal_band(Some(-80.0)), Some(SignalBand::Fair));
        assert_eq!(signal_band(Some(-80.1)), Some(SignalBand::Poor));
    }

    #[test]
    fn speed_boundaries() {
        assert_eq!(speed_band(None), SpeedBand::Stopped);
        assert_eq!(speed_band(Some(0.0)), SpeedBand::Stopped);
        assert_eq!(speed_band_kmh(5.0), SpeedBand::Walking);
        assert_eq!(speed_band_kmh(5.0001), SpeedBand::Running);
        assert_eq!(speed_band_kmh(10.0), SpeedBand::Running);
        assert_eq!(speed_band_kmh(60.0), SpeedBand::PublicTransport);
        assert_eq!(speed_band_kmh(60.1), SpeedBand::Vehicle);
        // 20 m/s = 72 km/h
        assert_eq!(speed_band(Some(20.0)), SpeedBand::Vehicle);
        assert_eq!(speed_band(Some(1.0)), SpeedBand::Walking);
    }

    #[test]
    fn network_normalization() {
        assert_eq!(network_generation(None), NetworkGeneration::Unknown);
        assert_eq!(network_generation(Some("")), NetworkGeneration::Unknown);
        assert_eq!(network_generation(Some("Wi-Fi")), NetworkGeneration::Wifi);
        assert_eq!(network_generation(Some("5g")), NetworkGeneration::G5);
        assert_eq!(network_generation(Some("NR")), NetworkGeneration::G5);
        assert_eq!(network_generation(Some("lte")), NetworkGeneration::G4);
        assert_eq!(network_generation(Some("4G+")), NetworkGeneration::G4);
        assert_eq!(network_generation(Some("HSPA+")), NetworkGeneration::G3);
        assert_eq!(network_generation(Some("wcdma")), NetworkGeneration::G3);
        assert_eq!(network_generation(Some("EDGE")), NetworkGeneration::G2);
        assert_eq!(network_generation(Some("gsm")), NetworkGeneration::G2);
        assert_eq!(network_generation(Some("CDMA2000")), NetworkGeneration::Unknown);
        assert_eq!(network_generation(Some("ethernet")), NetworkGeneration::Unknown);
    }

    #[test]
    fn operator_normalization() {
        assert_eq!(normalize_operator(None), NO_SIGNAL);
        assert_eq!(normalize_operator(Some("   ")), NO_SIGNAL);
        assert_eq!(normalize_operator(Some("Unknown")), NO_SIGNAL);
        assert_eq!(normalize_operator(Some("Sin señal")), NO_SIGNAL);
        assert_eq!(normalize_operator(Some("entel")), "ENTEL");
        assert_eq!(normalize_operator(Some("BOMOV")), "ENTEL");
        assert_eq!(normalize_operator(Some("+18vacunate")), "ENTEL");
        assert_eq!(normalize_operator(Some("Tigo Bolivia")), "TIGO");
        assert_eq!(normalize_operator(Some("Viva GSM")), "VIVA");
        assert_eq!(normalize_operator(Some(" claro ")), "CLARO");
    }

    #[test]
    fn timestamps_in_common_shapes() {
        let expected = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(8, 15, 0)
            .unwrap();
        assert_eq!(parse_timestamp("2024-05-01T08:15:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01 08:15:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T08:15:00-04:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01 08:15:00+00"), Some(expected));
        assert!(parse_timestamp("2024-05-01T08:15:00.123456").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn classify_derives_every_dimension() {
        let record = classify(raw(1, -17.7834, -63.1821), 0.01).unwrap();
        assert_eq!(record.period, Period::Afternoon);
        assert_eq!(record.altitude_band, Some(AltitudeBand::Mid));
        assert_eq!(record.battery_band, Some(BatteryBand::High));
        assert_eq!(record.signal_band, Some(SignalBand::Good));
        assert_eq!(record.speed_band, SpeedBand::Stopped);
        assert_eq!(record.network_generation, NetworkGeneration::G4);
        assert_eq!(record.operator_normalized, "ENTEL");
        assert_eq!(record.grid_lat, (-17.7834f64 / 0.01).floor() * 0.01);
        assert_eq!(record.grid_lon, (-63.1821f64 / 0.01).floor() * 0.01);
        assert_eq!(record.district_id, None);
    }

    #[test]
    fn classify_rejects_bad_coordinates_and_timestamps() {
        let mut missing = raw(2, 0.0, 0.0);
        missing.longitude = None;
        assert_eq!(
            classify(missing, 0.01),
            Err(Rejection::Invalid(ValidationError::MissingCoordinate { id: 2 }))
        );
        assert!(matches!(
            classify(raw(3, 200.0, 0.0), 0.01),
            Err(Rejection::Invalid(ValidationError::LatitudeOutOfRange { id: 3, .. }))
        ));
        assert!(matches!(
            classify(raw(4, 0.0, -180.5), 0.01),
            Err(Rejection::Invalid(ValidationError::LongitudeOutOfRange { id: 4, .. }))
        ));
        let mut bad_time = raw(5, 0.0, 0.0);
        bad_time.timestamp = Some("soon".to_string());
        assert!(matches!(
            classify(bad_time, 0.01),
            Err(Rejection::Malformed(TransformError::Timestamp { id: 5, .. }))
        ));
    }

    #[test]
    fn batch_drops_out_of_range_record() {
        let batch = classify_batch(
            vec![raw(10, -17.78, -63.18), raw(11, 200.0, -63.18), raw(12, -17.79, -63.17)],
            0.01,
            1,
        );
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.filtered, 1);
        assert_eq!(batch.malformed, 0);
        let mut ids: Vec<i64> = batch.records.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![10, 12]);
    }

    #[test]
    fn partitioned_and_sequential_results_agree() {
        let records: Vec<RawRecord> = (0..500)
            .map(|i| raw(i, -17.0 - (i as f64) * 0.003, -63.0 + (i as f64) * 0.002))
            .collect();
        let mut coarse = classify_batch(records.clone(), 0.01, 1_000).records;
        let mut fine = classify_batch(records, 0.01, 7).records;
        coarse.sort_by_key(|r| r.id);
        fine.sort_by_key(|r| r.id);
        assert_eq!(coarse, fine);
    }
}
