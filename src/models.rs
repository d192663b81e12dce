use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// One telemetry row as delivered by the origin. Never mutated after extraction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawRecord {
    pub id: i64,
    #[serde(deserialize_with = "lenient::string")]
    pub device_id: String,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub device_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub latitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub longitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub altitude: Option<f64>,
    /// Metres per second.
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub speed: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub battery: Option<f64>,
    /// dBm.
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub signal: Option<f64>,
    #[serde(default, alias = "sim_operator", deserialize_with = "lenient::opt_string")]
    pub operator: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub network_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Period {
    Morning,
    Afternoon,
    Night,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AltitudeBand {
    Low,
    Mid,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatteryBand {
    Critical,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalBand {
    Excellent,
    Good,
    Fair,
    Poor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpeedBand {
    Stopped,
    Walking,
    Running,
    PublicTransport,
    Vehicle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum NetworkGeneration {
    #[serde(rename = "WIFI")]
    Wifi,
    #[serde(rename = "5G")]
    G5,
    #[serde(rename = "4G")]
    G4,
    #[serde(rename = "3G")]
    G3,
    #[serde(rename = "2G")]
    G2,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Period::Morning => "MORNING",
            Period::Afternoon => "AFTERNOON",
            Period::Night => "NIGHT",
        }
    }
}

impl AltitudeBand {
    pub fn as_str(self) -> &'static str {
        match self {
            AltitudeBand::Low => "LOW",
            AltitudeBand::Mid => "MID",
            AltitudeBand::High => "HIGH",
        }
    }
}

impl BatteryBand {
    pub fn as_str(self) -> &'static str {
        match self {
            BatteryBand::Critical => "CRITICAL",
            BatteryBand::Low => "LOW",
            BatteryBand::Medium => "MEDIUM",
            BatteryBand::High => "HIGH",
        }
    }
}

impl SignalBand {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalBand::Excellent => "EXCELLENT",
            SignalBand::Good => "GOOD",
            SignalBand::Fair => "FAIR",
            SignalBand::Poor => "POOR",
        }
    }
}

impl SpeedBand {
    pub fn as_str(self) -> &'static str {
        match self {
            SpeedBand::Stopped => "STOPPED",
            SpeedBand::Walking => "WALKING",
            SpeedBand::Running => "RUNNING",
            SpeedBand::PublicTransport => "PUBLIC_TRANSPORT",
            SpeedBand::Vehicle => "VEHICLE",
        }
    }
}

impl NetworkGeneration {
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkGeneration::Wifi => "WIFI",
            NetworkGeneration::G5 => "5G",
            NetworkGeneration::G4 => "4G",
            NetworkGeneration::G3 => "3G",
            NetworkGeneration::G2 => "2G",
            NetworkGeneration::Unknown => "UNKNOWN",
        }
    }
}

/// A raw record plus every derived dimension. Region ids are filled in later by the assigner.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedRecord {
    pub id: i64,
    pub device_id: String,
    pub device_name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub battery: Option<f64>,
    pub signal: Option<f64>,
    pub operator: Option<String>,
    pub network_type: Option<String>,
    pub recorded_at: NaiveDateTime,
    pub period: Period,
    pub altitude_band: Option<AltitudeBand>,
    pub battery_band: Option<BatteryBand>,
    pub signal_band: Option<SignalBand>,
    pub speed_band: SpeedBand,
    pub network_generation: NetworkGeneration,
    pub operator_normalized: String,
    pub grid_lat: f64,
    pub grid_lon: f64,
    pub district_id: Option<i64>,
    pub province_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridCell {
    pub grid_lat: f64,
    pub grid_lon: f64,
    pub cell_size: f64,
    pub point_count: i64,
    pub unique_device_count: i64,
    pub avg_battery: Option<f64>,
    pub avg_signal: Option<f64>,
    pub avg_altitude: Option<f64>,
    pub avg_speed: Option<f64>,
    pub network_distribution: BTreeMap<String, i64>,
    pub operator_distribution: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStats {
    pub device_id: String,
    pub device_name: Option<String>,
    pub total_records: i64,
    pub first_seen: NaiveDateTime,
    pub last_seen: NaiveDateTime,
    pub avg_battery: Option<f64>,
    pub avg_signal: Option<f64>,
    pub avg_speed: Option<f64>,
    pub mean_latitude: f64,
    pub mean_longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total_points: usize,
    pub unique_devices: usize,
    pub avg_battery: Option<f64>,
    pub avg_signal: Option<f64>,
    pub avg_speed: Option<f64>,
    pub first_timestamp: Option<NaiveDateTime>,
    pub last_timestamp: Option<NaiveDateTime>,
    pub network_distribution: BTreeMap<String, i64>,
    pub operator_distribution: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum)]
pub enum RegionKind {
    District,
    Province,
}

impl RegionKind {
    pub fn table(self) -> &'static str {
        match self {
            RegionKind::District => "districts",
            RegionKind::Province => "provinces",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RegionKind::District => "District",
            RegionKind::Province => "Province",
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKind::District => f.write_str("district"),
            RegionKind::Province => f.write_str("province"),
        }
    }
}

/// A region row as stored; geometry is still GeoJSON.
#[derive(Debug, Clone)]
pub struct RegionRecord {
    pub id: i64,
    pub kind: RegionKind,
    pub name: String,
    pub geometry: serde_json::Value,
    pub area_km2: Option<f64>,
    pub perimeter_km: Option<f64>,
}

/// The slice of a stored point the region assigner needs.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentTarget {
    pub id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub district_id: Option<i64>,
    pub province_id: Option<i64>,
}

/// Fields to write back for one point. `None` means leave the column alone.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub id: i64,
    pub district_id: Option<i64>,
    pub province_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Append,
    Overwrite,
}

/// Inclusive calendar-day bounds on the origin timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

mod lenient {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        let value = match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| D::Error::custom(format!("number {n} out of range")))?,
            Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
            Some(Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| D::Error::custom(format!("expected a number, found {s:?}")))?,
            Some(other) => {
                return Err(D::Error::custom(format!("expected a number, found {other}")))
            }
        };
        if value.is_finite() {
            Ok(Some(value))
        } else {
            Err(D::Error::custom("non-finite number"))
        }
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(other) => Err(D::Error::custom(format!("expected text, found {other}"))),
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        match opt_string(d)? {
            Some(s) if !s.trim().is_empty() => Ok(s),
            _ => Err(D::Error::custom("value is required")),
        }
    }
}
