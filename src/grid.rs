use std::collections::{BTreeMap, HashMap, HashSet};

use rayon::prelude::*;

use crate::models::{ClassifiedRecord, GridCell};

/// South-west corner of the cell containing `coord`.
pub fn cell_origin(coord: f64, cell_size: f64) -> f64 {
    (coord / cell_size).floor() * cell_size
}

fn cell_index(coord: f64, cell_size: f64) -> i64 {
    (coord / cell_size).floor() as i64
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Running mean over the values that are present.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mean {
    sum: f64,
    count: u64,
}

impl Mean {
    pub fn push(&mut self, value: Option<f64>) {
        if let Some(value) = value {
            self.sum += value;
            self.count += 1;
        }
    }

    pub fn merge(&mut self, other: Mean) {
        self.sum += other.sum;
        self.count += other.count;
    }

    pub fn value(&self, places: i32) -> Option<f64> {
        (self.count > 0).then(|| round_to(self.sum / self.count as f64, places))
    }
}

#[derive(Debug, Default)]
struct CellAccumulator {
    points: i64,
    devices: HashSet<String>,
    battery: Mean,
    signal: Mean,
    altitude: Mean,
    speed: Mean,
    networks: BTreeMap<String, i64>,
    operators: BTreeMap<String, i64>,
}

impl CellAccumulator {
    fn push(&mut self, record: &ClassifiedRecord) {
        self.points += 1;
        self.devices.insert(record.device_id.clone());
        self.battery.push(record.battery);
        self.signal.push(record.signal);
        self.altitude.push(record.altitude);
        self.speed.push(record.speed);
        *self
            .networks
            .entry(record.network_generation.as_str().to_string())
            .or_insert(0) += 1;
        *self
            .operators
            .entry(record.operator_normalized.clone())
            .or_insert(0) += 1;
    }

    fn merge(&mut self, other: CellAccumulator) {
        self.points += other.points;
        self.devices.extend(other.devices);
        self.battery.merge(other.battery);
        self.signal.merge(other.signal);
        self.altitude.merge(other.altitude);
        self.speed.merge(other.speed);
        for (key, count) in other.networks {
            *self.networks.entry(key).or_insert(0) += count;
        }
        for (key, count) in other.operators {
            *self.operators.entry(key).or_insert(0) += count;
        }
    }
}

type CellMap = HashMap<(i64, i64), CellAccumulator>;

fn merge_maps(mut left: CellMap, right: CellMap) -> CellMap {
    for (key, acc) in right {
        left.entry(key).or_default().merge(acc);
    }
    left
}

/// Groups the current batch into `cell_size` cells. Output is sorted by (grid_lat, grid_lon).
pub fn aggregate(records: &[ClassifiedRecord], cell_size: f64) -> Vec<GridCell> {
    let groups = records
        .par_iter()
        .fold(CellMap::new, |mut map, record| {
            let key = (
                cell_index(record.latitude, cell_size),
                cell_index(record.longitude, cell_size),
            );
            map.entry(key).or_default().push(record);
            map
        })
        .reduce(CellMap::new, merge_maps);

    let mut cells: Vec<(i64, i64, CellAccumulator)> = groups
        .into_iter()
        .map(|((lat, lon), acc)| (lat, lon, acc))
        .collect();
    cells.sort_by_key(|(lat, lon, _)| (*lat, *lon));

    cells
        .into_iter()
        .map(|(lat_idx, lon_idx, acc)| GridCell {
            grid_lat: lat_idx as f64 * cell_size,
            grid_lon: lon_idx as f64 * cell_size,
            cell_size,
            point_count: acc.points,
            unique_device_count: acc.devices.len() as i64,
            avg_battery: acc.battery.value(2),
            avg_signal: acc.signal.value(2),
            avg_altitude: acc.altitude.value(2),
            avg_speed: acc.speed.value(2),
            network_distribution: acc.networks,
            operator_distribution: acc.operators,
        })
        .collect()
}

impl GridCell {
    /// Closed ring of (lon, lat) corners, counter-clockwise from the anchor.
    pub fn ring(&self) -> [(f64, f64); 5] {
        let (x, y, s) = (self.grid_lon, self.grid_lat, self.cell_size);
        [(x, y), (x + s, y), (x + s, y + s), (x, y + s), (x, y)]
    }

    pub fn polygon_ewkt(&self) -> String {
        let corners: Vec<String> = self
            .ring()
            .iter()
            .map(|(lon, lat)| format!("{lon} {lat}"))
            .collect();
        format!("SRID=4326;POLYGON(({}))", corners.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use crate::models::RawRecord;

    fn point(id: i64, device: &str, lat: f64, lon: f64, battery: Option<f64>) -> ClassifiedRecord {
        let raw = RawRecord {
            id,
            device_id: device.to_string(),
            device_name: None,
            latitude: Some(lat),
            longitude: Some(lon),
            altitude: None,
            speed: Some(2.0),
            battery,
            signal: Some(-71.0),
            operator: Some("Tigo".to_string()),
            network_type: Some("LTE".to_string()),
            timestamp: Some("2024-05-01T09:00:00".to_string()),
        };
        classify(raw, 0.01).unwrap()
    }

    #[test]
    fn cell_origin_is_floor_times_size() {
        for &(coord, size) in &[
            (-17.78345, 0.01),
            (63.1, 0.01),
            (0.0, 0.01),
            (-0.004, 0.01),
            (89.999, 0.5),
            (-180.0, 0.25),
            (12.345678, 0.001),
        ] {
            assert_eq!(cell_origin(coord, size), (coord / size).floor() * size);
            assert_eq!(
                cell_index(coord, size) as f64 * size,
                (coord / size).floor() * size
            );
        }
        assert_eq!(cell_origin(-0.004, 0.01), -0.01);
    }

    #[test]
    fn groups_by_cell_and_counts_devices() {
        let records = vec![
            point(1, "a", -17.781, -63.181, Some(50.0)),
            point(2, "a", -17.782, -63.182, Some(61.0)),
            point(3, "b", -17.785, -63.189, None),
            point(4, "c", -17.70, -63.10, Some(10.0)),
        ];
        let cells = aggregate(&records, 0.01);
        assert_eq!(cells.len(), 2);

        let busy = cells.iter().find(|c| c.point_count == 3).unwrap();
        assert_eq!(busy.unique_device_count, 2);
        assert_eq!(busy.avg_battery, Some(55.5));
        assert_eq!(busy.avg_signal, Some(-71.0));
        assert_eq!(busy.avg_altitude, None);
        assert_eq!(busy.network_distribution.get("4G"), Some(&3));
        assert_eq!(busy.operator_distribution.get("TIGO"), Some(&3));
        assert_eq!(busy.grid_lat, cell_origin(-17.781, 0.01));
        assert_eq!(busy.grid_lon, cell_origin(-63.181, 0.01));
    }

    #[test]
    fn keys_are_unique_and_sorted() {
        let records: Vec<ClassifiedRecord> = (0..200)
            .map(|i| point(i, "d", -17.005 - (i % 13) as f64 * 0.01, -63.005, Some(1.0)))
            .collect();
        let cells = aggregate(&records, 0.01);
        assert_eq!(cells.len(), 13);
        let total: i64 = cells.iter().map(|c| c.point_count).sum();
        assert_eq!(total, 200);
        assert!(cells
            .windows(2)
            .all(|w| (w[0].grid_lat, w[0].grid_lon) < (w[1].grid_lat, w[1].grid_lon)));
    }

    #[test]
    fn averages_round_to_two_places() {
        let records = vec![
            point(1, "a", 1.001, 1.001, Some(10.0)),
            point(2, "a", 1.002, 1.002, Some(10.0)),
            point(3, "a", 1.003, 1.003, Some(11.0)),
        ];
        let cells = aggregate(&records, 0.01);
        assert_eq!(cells[0].avg_battery, Some(10.33));
    }

    #[test]
    fn polygon_is_anchored_square() {
        let cells = aggregate(&[point(1, "a", 1.005, 2.005, None)], 0.5);
        let ring = cells[0].ring();
        assert_eq!(ring[0], (2.0, 1.0));
        assert_eq!(ring[2], (2.5, 1.5));
        assert_eq!(ring[0], ring[4]);
        assert_eq!(
            cells[0].polygon_ewkt(),
            "SRID=4326;POLYGON((2 1,2.5 1,2.5 1.5,2 1.5,2 1))"
        );
    }

    #[test]
    fn empty_batch_yields_no_cells() {
        assert!(aggregate(&[], 0.01).is_empty());
    }
}
