use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDateTime;

use crate::grid::{round_to, Mean};
use crate::models::{BatchSummary, ClassifiedRecord, DeviceStats};

struct DeviceAccumulator {
    name: Option<String>,
    total: i64,
    first_seen: NaiveDateTime,
    last_seen: NaiveDateTime,
    battery: Mean,
    signal: Mean,
    speed: Mean,
    lat_sum: f64,
    lon_sum: f64,
}

/// Per-device statistics for the current window, sorted by device id.
pub fn aggregate_by_device(records: &[ClassifiedRecord]) -> Vec<DeviceStats> {
    let mut devices: HashMap<&str, DeviceAccumulator> = HashMap::new();

    for record in records {
        let acc = devices
            .entry(record.device_id.as_str())
            .or_insert_with(|| DeviceAccumulator {
                name: None,
                total: 0,
                first_seen: record.recorded_at,
                last_seen: record.recorded_at,
                battery: Mean::default(),
                signal: Mean::default(),
                speed: Mean::default(),
                lat_sum: 0.0,
                lon_sum: 0.0,
            });
        if acc.name.is_none() {
            acc.name = record
                .device_name
                .as_ref()
                .filter(|n| !n.trim().is_empty())
                .cloned();
        }
        acc.total += 1;
        acc.first_seen = acc.first_seen.min(record.recorded_at);
        acc.last_seen = acc.last_seen.max(record.recorded_at);
        acc.battery.push(record.battery);
        acc.signal.push(record.signal);
        acc.speed.push(record.speed);
        acc.lat_sum += record.latitude;
        acc.lon_sum += record.longitude;
    }

    let mut stats: Vec<DeviceStats> = devices
        .into_iter()
        .map(|(device_id, acc)| DeviceStats {
            device_id: device_id.to_string(),
            device_name: acc.name,
            total_records: acc.total,
            first_seen: acc.first_seen,
            last_seen: acc.last_seen,
            avg_battery: acc.battery.value(2),
            avg_signal: acc.signal.value(2),
            avg_speed: acc.speed.value(2),
            mean_latitude: round_to(acc.lat_sum / acc.total as f64, 6),
            mean_longitude: round_to(acc.lon_sum / acc.total as f64, 6),
        })
        .collect();
    stats.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    stats
}

pub fn summarize(records: &[ClassifiedRecord]) -> BatchSummary {
    let mut devices = HashSet::new();
    let mut battery = Mean::default();
    let mut signal = Mean::default();
    let mut speed = Mean::default();
    let mut networks: BTreeMap<String, i64> = BTreeMap::new();
    let mut operators: BTreeMap<String, i64> = BTreeMap::new();

    for record in records {
        devices.insert(record.device_id.as_str());
        battery.push(record.battery);
        signal.push(record.signal);
        speed.push(record.speed);
        *networks
            .entry(record.network_generation.as_str().to_string())
            .or_insert(0) += 1;
        *operators
            .entry(record.operator_normalized.clone())
            .or_insert(0) += 1;
    }

    BatchSummary {
        total_points: records.len(),
        unique_devices: devices.len(),
        avg_battery: battery.value(2),
        avg_signal: signal.value(2),
        avg_speed: speed.value(2),
        first_timestamp: records.iter().map(|r| r.recorded_at).min(),
        last_timestamp: records.iter().map(|r| r.recorded_at).max(),
        network_distribution: networks,
        operator_distribution: operators,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use crate::models::RawRecord;

    fn record(id: i64, device: &str, name: Option<&str>, ts: &str, battery: Option<f64>) -> ClassifiedRecord {
        classify(
            RawRecord {
                id,
                device_id: device.to_string(),
                device_name: name.map(str::to_string),
                latitude: Some(-17.5 + id as f64 * 0.001),
                longitude: Some(-63.5),
                altitude: None,
                speed: None,
                battery,
                signal: None,
                operator: None,
                network_type: Some("3G".to_string()),
                timestamp: Some(ts.to_string()),
            },
            0.01,
        )
        .unwrap()
    }

    #[test]
    fn device_statistics_span_the_window() {
        let records = vec![
            record(1, "dev-1", None, "2024-05-01T10:00:00", Some(40.0)),
            record(2, "dev-1", Some("Galaxy"), "2024-05-01T08:00:00", None),
            record(3, "dev-1", Some("Other"), "2024-05-02T08:00:00", Some(45.0)),
            record(4, "dev-2", Some("Moto"), "2024-05-01T12:00:00", Some(90.0)),
        ];
        let stats = aggregate_by_device(&records);
        assert_eq!(stats.len(), 2);

        let first = &stats[0];
        assert_eq!(first.device_id, "dev-1");
        assert_eq!(first.device_name.as_deref(), Some("Galaxy"));
        assert_eq!(first.total_records, 3);
        assert_eq!(first.first_seen.to_string(), "2024-05-01 08:00:00");
        assert_eq!(first.last_seen.to_string(), "2024-05-02 08:00:00");
        assert_eq!(first.avg_battery, Some(42.5));
        assert_eq!(first.avg_speed, None);
        assert_eq!(first.mean_latitude, -17.498);
    }

    #[test]
    fn summary_counts_distributions() {
        let records = vec![
            record(1, "dev-1", None, "2024-05-01T10:00:00", Some(40.0)),
            record(2, "dev-2", None, "2024-05-03T10:00:00", Some(60.0)),
        ];
        let summary = summarize(&records);
        assert_eq!(summary.total_points, 2);
        assert_eq!(summary.unique_devices, 2);
        assert_eq!(summary.avg_battery, Some(50.0));
        assert_eq!(summary.network_distribution.get("3G"), Some(&2));
        assert_eq!(summary.operator_distribution.get("NO_SIGNAL"), Some(&2));
        assert_eq!(
            summary.last_timestamp.map(|t| t.to_string()).as_deref(),
            Some("2024-05-03 10:00:00")
        );
    }
}
