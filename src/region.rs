//! Point-in-polygon assignment of telemetry points to districts and provinces.
//!
//! Each region kind gets its own R-tree over polygon bounding boxes. A lookup
//! asks the tree for candidate envelopes containing the point and then runs the
//! exact, boundary-inclusive containment test on those candidates only.

use geo::coordinate_position::CoordPos;
use geo::{
    BoundingRect, Coord, CoordinatePosition, GeodesicArea, LineString, MultiPolygon, Polygon,
};
use rstar::{RTree, RTreeObject, AABB};
use serde_json::Value;

use crate::error::AssignmentError;
use crate::models::{Assignment, AssignmentTarget, RegionKind, RegionRecord};

#[derive(Debug, Clone)]
pub struct Region {
    pub id: i64,
    pub kind: RegionKind,
    pub name: String,
    pub polygon: MultiPolygon<f64>,
    pub area_km2: f64,
    pub perimeter_km: f64,
}

impl Region {
    pub fn from_record(record: RegionRecord) -> Result<Self, AssignmentError> {
        let polygon = multipolygon_from_geojson(&record.geometry).map_err(|message| {
            AssignmentError::InvalidGeometry {
                kind: record.kind,
                id: record.id,
                message,
            }
        })?;
        let (area_km2, perimeter_km) = match (record.area_km2, record.perimeter_km) {
            (Some(area), Some(perimeter)) => (area, perimeter),
            _ => measure(&polygon),
        };
        Ok(Self {
            id: record.id,
            kind: record.kind,
            name: record.name,
            polygon,
            area_km2,
            perimeter_km,
        })
    }

    pub fn contains(&self, coord: Coord<f64>) -> bool {
        self.polygon.coordinate_position(&coord) != CoordPos::Outside
    }
}

/// Geodesic area (km²) and perimeter (km), both rounded to two places.
pub fn measure(polygon: &MultiPolygon<f64>) -> (f64, f64) {
    let area = polygon.geodesic_area_unsigned() / 1_000_000.0;
    let perimeter: f64 = polygon
        .0
        .iter()
        .map(|p| p.geodesic_perimeter())
        .sum::<f64>()
        / 1_000.0;
    (
        crate::grid::round_to(area, 2),
        crate::grid::round_to(perimeter, 2),
    )
}

/// Parses a GeoJSON `Polygon` or `MultiPolygon` geometry object.
pub fn multipolygon_from_geojson(geometry: &Value) -> Result<MultiPolygon<f64>, String> {
    let kind = geometry
        .get("type")
        .and_then(Value::as_str)
        .ok_or("geometry has no type")?;
    let coordinates = geometry
        .get("coordinates")
        .ok_or("geometry has no coordinates")?;
    let polygons = match kind {
        "Polygon" => vec![polygon_from_rings(coordinates)?],
        "MultiPolygon" => coordinates
            .as_array()
            .ok_or("MultiPolygon coordinates must be an array")?
            .iter()
            .map(polygon_from_rings)
            .collect::<Result<Vec<_>, _>>()?,
        other => return Err(format!("unsupported geometry type {other}")),
    };
    if polygons.is_empty() {
        return Err("geometry has no polygons".to_string());
    }
    Ok(MultiPolygon(polygons))
}

fn polygon_from_rings(rings: &Value) -> Result<Polygon<f64>, String> {
    let rings = rings.as_array().ok_or("polygon rings must be an array")?;
    let mut parsed = rings.iter().map(ring_from_positions);
    let exterior = parsed.next().ok_or("polygon has no exterior ring")??;
    let interiors = parsed.collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn ring_from_positions(ring: &Value) -> Result<LineString<f64>, String> {
    let positions = ring.as_array().ok_or("ring must be an array")?;
    let coords = positions
        .iter()
        .map(|position| {
            let pair = position.as_array().filter(|p| p.len() >= 2);
            match pair.map(|p| (p[0].as_f64(), p[1].as_f64())) {
                Some((Some(x), Some(y))) if x.is_finite() && y.is_finite() => Ok(Coord { x, y }),
                _ => Err(format!("invalid position {position}")),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    if coords.len() < 4 {
        return Err(format!("ring has {} positions, need at least 4", coords.len()));
    }
    Ok(LineString::from(coords))
}

pub fn multipolygon_to_geojson(polygon: &MultiPolygon<f64>) -> Value {
    let ring = |ls: &LineString<f64>| -> Value {
        Value::Array(
            ls.coords()
                .map(|c| serde_json::json!([c.x, c.y]))
                .collect(),
        )
    };
    let polygons: Vec<Value> = polygon
        .0
        .iter()
        .map(|p| {
            let mut rings = vec![ring(p.exterior())];
            rings.extend(p.interiors().iter().map(ring));
            Value::Array(rings)
        })
        .collect();
    serde_json::json!({ "type": "MultiPolygon", "coordinates": polygons })
}

/// A region parsed from a boundary file, ready to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRegion {
    pub name: String,
    pub code: Option<String>,
    pub geometry: Value,
    pub area_km2: f64,
    pub perimeter_km: f64,
}

const NAME_KEYS: [&str; 4] = ["name", "NAME", "nombre", "NOMBRE"];
const CODE_KEYS: [&str; 3] = ["code", "id", "DISTRITO"];

/// Reads a GeoJSON FeatureCollection of Polygon/MultiPolygon features.
/// Geometry is normalized to MultiPolygon before it is stored.
pub fn regions_from_feature_collection(
    kind: RegionKind,
    collection: &Value,
) -> anyhow::Result<Vec<NewRegion>> {
    let features = collection
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("expected a GeoJSON FeatureCollection"))?;

    let mut regions = Vec::with_capacity(features.len());
    for (idx, feature) in features.iter().enumerate() {
        let geometry = feature.get("geometry").unwrap_or(&Value::Null);
        let polygon = multipolygon_from_geojson(geometry)
            .map_err(|message| anyhow::anyhow!("feature {}: {message}", idx + 1))?;
        let properties = feature.get("properties");
        let property = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| properties.and_then(|p| p.get(*key)))
                .find_map(|value| match value {
                    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
        };
        let (area_km2, perimeter_km) = measure(&polygon);
        regions.push(NewRegion {
            name: property(&NAME_KEYS[..]).unwrap_or_else(|| format!("{} {}", kind.label(), idx + 1)),
            code: property(&CODE_KEYS[..]),
            geometry: multipolygon_to_geojson(&polygon),
            area_km2,
            perimeter_km,
        });
    }
    Ok(regions)
}

struct Envelope {
    ordinal: usize,
    bounds: AABB<[f64; 2]>,
}

impl RTreeObject for Envelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.bounds
    }
}

/// Spatial index over one region kind. Regions are held in ascending id order,
/// which is the tie-break when a point falls inside more than one of them.
pub struct RegionIndex {
    regions: Vec<Region>,
    tree: RTree<Envelope>,
}

impl RegionIndex {
    pub fn build(mut regions: Vec<Region>) -> Self {
        regions.sort_by_key(|r| r.id);
        let envelopes = regions
            .iter()
            .enumerate()
            .filter_map(|(ordinal, region)| {
                region.polygon.bounding_rect().map(|rect| Envelope {
                    ordinal,
                    bounds: AABB::from_corners(
                        [rect.min().x, rect.min().y],
                        [rect.max().x, rect.max().y],
                    ),
                })
            })
            .collect();
        Self {
            regions,
            tree: RTree::bulk_load(envelopes),
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn locate(&self, latitude: f64, longitude: f64) -> Option<&Region> {
        let coord = Coord {
            x: longitude,
            y: latitude,
        };
        let probe = AABB::from_point([longitude, latitude]);
        self.tree
            .locate_in_envelope_intersecting(&probe)
            .map(|envelope| envelope.ordinal)
            .filter(|&ordinal| self.regions[ordinal].contains(coord))
            .min()
            .map(|ordinal| &self.regions[ordinal])
    }
}

/// District and province indexes used together by one assignment pass.
pub struct RegionSet {
    pub districts: RegionIndex,
    pub provinces: RegionIndex,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AssignStats {
    pub examined: usize,
    pub districts_assigned: usize,
    pub provinces_assigned: usize,
}

impl RegionSet {
    /// Builds both indexes, skipping (and reporting) regions whose geometry is unusable.
    pub fn from_records(records: Vec<RegionRecord>) -> (Self, Vec<AssignmentError>) {
        let mut districts = Vec::new();
        let mut provinces = Vec::new();
        let mut rejected = Vec::new();
        for record in records {
            match Region::from_record(record) {
                Ok(region) => {
                    tracing::debug!(
                        kind = %region.kind,
                        id = region.id,
                        name = %region.name,
                        area_km2 = region.area_km2,
                        perimeter_km = region.perimeter_km,
                        "region loaded"
                    );
                    match region.kind {
                        RegionKind::District => districts.push(region),
                        RegionKind::Province => provinces.push(region),
                    }
                }
                Err(err) => rejected.push(err),
            }
        }
        (
            Self {
                districts: RegionIndex::build(districts),
                provinces: RegionIndex::build(provinces),
            },
            rejected,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.districts.is_empty() && self.provinces.is_empty()
    }

    /// Computes the region ids to write. A populated field is never replaced, and
    /// points with no containing region produce nothing.
    pub fn assign(&self, targets: &[AssignmentTarget]) -> (Vec<Assignment>, AssignStats) {
        let mut stats = AssignStats::default();
        let mut updates = Vec::new();
        for target in targets {
            stats.examined += 1;
            let district_id = target
                .district_id
                .is_none()
                .then(|| self.districts.locate(target.latitude, target.longitude))
                .flatten()
                .map(|r| r.id);
            let province_id = target
                .province_id
                .is_none()
                .then(|| self.provinces.locate(target.latitude, target.longitude))
                .flatten()
                .map(|r| r.id);
            if district_id.is_some() {
                stats.districts_assigned += 1;
            }
            if province_id.is_some() {
                stats.provinces_assigned += 1;
            }
            if district_id.is_some() || province_id.is_some() {
                updates.push(Assignment {
                    id: target.id,
                    district_id,
                    province_id,
                });
            }
        }
        (updates, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn square(id: i64, kind: RegionKind, x0: f64, y0: f64, side: f64) -> RegionRecord {
        RegionRecord {
            id,
            kind,
            name: format!("{} {id}", kind.label()),
            geometry: json!({
                "type": "Polygon",
                "coordinates": [[[x0, y0], [x0 + side, y0], [x0 + side, y0 + side], [x0, y0 + side], [x0, y0]]]
            }),
            area_km2: None,
            perimeter_km: None,
        }
    }

    fn target(id: i64, latitude: f64, longitude: f64) -> AssignmentTarget {
        AssignmentTarget {
            id,
            latitude,
            longitude,
            district_id: None,
            province_id: None,
        }
    }

    fn partition() -> RegionSet {
        let (set, rejected) = RegionSet::from_records(vec![
            square(2, RegionKind::District, 0.0, 0.0, 1.0),
            square(1, RegionKind::District, 1.0, 0.0, 1.0),
            square(10, RegionKind::Province, 0.0, 0.0, 2.0),
        ]);
        assert!(rejected.is_empty());
        set
    }

    #[test]
    fn parses_polygon_and_multipolygon() {
        let poly = json!({"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]});
        assert_eq!(multipolygon_from_geojson(&poly).unwrap().0.len(), 1);

        let multi = json!({"type": "MultiPolygon", "coordinates": [
            [[[0,0],[1,0],[1,1],[0,1],[0,0]]],
            [[[5,5],[6,5],[6,6],[5,6],[5,5]], [[5.2,5.2],[5.4,5.2],[5.4,5.4],[5.2,5.2]]]
        ]});
        let parsed = multipolygon_from_geojson(&multi).unwrap();
        assert_eq!(parsed.0.len(), 2);
        assert_eq!(parsed.0[1].interiors().len(), 1);

        let round_trip = multipolygon_from_geojson(&multipolygon_to_geojson(&parsed)).unwrap();
        assert_eq!(round_trip, parsed);
    }

    #[test]
    fn rejects_unusable_geometry() {
        assert!(multipolygon_from_geojson(&json!({"type": "Point", "coordinates": [0, 0]})).is_err());
        assert!(multipolygon_from_geojson(&json!({"type": "Polygon", "coordinates": [[[0, 0], [1, 1]]]})).is_err());
        assert!(multipolygon_from_geojson(&json!({"type": "Polygon", "coordinates": [[[0, "x"], [1, 0], [1, 1], [0, 0]]]})).is_err());

        let mut broken = square(5, RegionKind::District, 0.0, 0.0, 1.0);
        broken.geometry = json!({"type": "Polygon"});
        let (set, rejected) = RegionSet::from_records(vec![broken]);
        assert!(set.is_empty());
        assert!(matches!(
            rejected.as_slice(),
            [AssignmentError::InvalidGeometry { id: 5, .. }]
        ));
    }

    #[test]
    fn containment_includes_boundary() {
        let set = partition();
        assert_eq!(set.districts.locate(0.5, 0.5).map(|r| r.id), Some(2));
        assert_eq!(set.districts.locate(0.5, 1.5).map(|r| r.id), Some(1));
        assert_eq!(set.districts.locate(0.0, 0.0).map(|r| r.id), Some(2));
        assert_eq!(set.districts.locate(1.0, 0.3).map(|r| r.id), Some(2));
        assert_eq!(set.districts.locate(3.0, 3.0).map(|r| r.id), None);
    }

    #[test]
    fn shared_edge_resolves_to_lowest_id() {
        let set = partition();
        // x = 1.0 lies on the edge shared by districts 1 and 2.
        assert_eq!(set.districts.locate(0.5, 1.0).map(|r| r.id), Some(1));
    }

    #[test]
    fn assigns_missing_fields_only() {
        let set = partition();
        let mut already = target(2, 0.5, 0.5);
        already.district_id = Some(99);
        let targets = vec![target(1, 0.5, 1.5), already, target(3, 5.0, 5.0)];

        let (updates, stats) = set.assign(&targets);
        assert_eq!(stats.examined, 3);
        assert_eq!(
            updates,
            vec![
                Assignment { id: 1, district_id: Some(1), province_id: Some(10) },
                Assignment { id: 2, district_id: None, province_id: Some(10) },
            ]
        );
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let set = partition();
        let mut targets = vec![target(1, 0.5, 1.5), target(2, 0.25, 0.25)];
        let (updates, _) = set.assign(&targets);
        for update in &updates {
            let row = targets.iter_mut().find(|t| t.id == update.id).unwrap();
            row.district_id = update.district_id.or(row.district_id);
            row.province_id = update.province_id.or(row.province_id);
        }
        let (again, stats) = set.assign(&targets);
        assert!(again.is_empty());
        assert_eq!(stats.districts_assigned, 0);
    }

    #[test]
    fn populated_fields_are_left_alone() {
        let set = partition();
        let mut stale = target(1, 0.5, 1.5);
        stale.district_id = Some(2);
        stale.province_id = Some(10);
        let (updates, stats) = set.assign(&[stale]);
        assert!(updates.is_empty());
        assert_eq!(stats.examined, 1);
    }

    #[test]
    fn index_scales_past_a_nested_loop() {
        let records: Vec<RegionRecord> = (0..400)
            .map(|i| square(i, RegionKind::District, (i % 20) as f64, (i / 20) as f64, 1.0))
            .collect();
        let (set, _) = RegionSet::from_records(records);
        assert_eq!(set.districts.len(), 400);
        assert_eq!(set.districts.locate(7.5, 3.5).map(|r| r.id), Some(7 * 20 + 3));
    }

    #[test]
    fn reads_feature_collection_properties() {
        let collection = json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "properties": {"NOMBRE": "Distrito 1", "DISTRITO": 1},
                    "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}
                },
                {
                    "type": "Feature",
                    "properties": {},
                    "geometry": {"type": "MultiPolygon", "coordinates": [[[[2,2],[3,2],[3,3],[2,3],[2,2]]]]}
                }
            ]
        });
        let regions = regions_from_feature_collection(RegionKind::District, &collection).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].name, "Distrito 1");
        assert_eq!(regions[0].code.as_deref(), Some("1"));
        assert_eq!(regions[0].geometry["type"], "MultiPolygon");
        assert_eq!(regions[1].name, "District 2");
        assert_eq!(regions[1].code, None);
        assert!(regions[1].area_km2 > 0.0);
    }

    #[test]
    fn feature_collection_rejects_bad_features() {
        let collection = json!({"type": "FeatureCollection", "features": [{"type": "Feature", "geometry": null}]});
        assert!(regions_from_feature_collection(RegionKind::Province, &collection).is_err());
        assert!(regions_from_feature_collection(RegionKind::Province, &json!({"type": "Feature"})).is_err());
    }

    #[test]
    fn measures_geodesic_size() {
        let region = Region::from_record(square(1, RegionKind::Province, 0.0, 0.0, 1.0)).unwrap();
        // One degree square at the equator is roughly 111 km on a side.
        assert!((region.area_km2 - 12_308.0).abs() < 100.0);
        assert!((region.perimeter_km - 443.0).abs() < 5.0);
    }
}
