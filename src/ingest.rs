//! Reads an authority delivery: a directory with `links.geojson` (water
//! courses), `structures.geojson`, `nodes.geojson` (boundaries),
//! `areas.geojson`, `profiles.geojson` and `supply_area.geojson` (the area
//! the authority keeps at level). Any file may be absent.
//! Features with unusable geometry are dropped and reported.

use crate::basin_area::CandidateArea;
use crate::error::{Error, Result};
use crate::geometry::{self, polygon};
use crate::model::node::{META_FUNCTION, META_STREEFPEIL};
use crate::model::{BasinArea, MetaValue, NodeType};
use crate::network::InputLine;
use crate::network::model_builder::{BoundaryPoint, StructurePoint};
use crate::parametrization::target_level::ProfilePoint;
use crate::persistence::geojson_io::{Properties, feature_geometry, read_feature_collection};
use crate::report::{FindingKind, Report, Stage};
use geo_types::{Geometry, MultiLineString, MultiPolygon, Point};
use geojson::Feature;
use std::path::Path;
use tracing::info;

pub const LINKS_FILE: &str = "links.geojson";
pub const STRUCTURES_FILE: &str = "structures.geojson";
pub const NODES_FILE: &str = "nodes.geojson";
pub const AREAS_FILE: &str = "areas.geojson";
pub const SECOND_LAYER_FILE: &str = "areas_second_layer.geojson";
pub const PROFILES_FILE: &str = "profiles.geojson";
pub const SUPPLY_AREA_FILE: &str = "supply_area.geojson";
pub const EDITS_FILE: &str = "edits.json";
pub const STATIC_DATA_DIR: &str = "static_data";

#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub lines: Vec<InputLine>,
    pub structures: Vec<StructurePoint>,
    pub boundaries: Vec<BoundaryPoint>,
    pub areas: Vec<CandidateArea>,
    /// Coarser areas consulted when the overlap with the first is low
    pub second_layer: Option<Vec<BasinArea>>,
    pub profiles: Vec<ProfilePoint>,
    /// Union of the supply-area polygons; decides which structures drain
    /// and which feed when control is attached
    pub supply_area: Option<MultiPolygon>,
}

/// Node type of a delivered structure: an explicit `node_type`, else the
/// Dutch object type in `type`.
pub fn structure_type(props: &Properties) -> Option<(NodeType, Option<&'static str>)> {
    if let Some(node_type) = props.str("node_type").and_then(|t| t.parse::<NodeType>().ok()) {
        return Some((node_type, None));
    }
    let kind = props.str("type")?.to_lowercase();
    match kind.as_str() {
        "gemaal" => Some((NodeType::Pump, None)),
        "inlaat" => Some((NodeType::Outlet, Some("inlet"))),
        "uitlaat" => Some((NodeType::Outlet, Some("outlet"))),
        "stuw" | "sluis" | "afsluitmiddel" | "vispassage" => Some((NodeType::Outlet, None)),
        "duiker" | "brug" | "sifon" => Some((NodeType::ManningResistance, None)),
        _ => None,
    }
}

fn features(dir: &Path, file: &str) -> Result<Vec<Feature>> {
    let path = dir.join(file);
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(read_feature_collection(&path)?.features)
}

fn dropped(report: &mut Report, file: &str, index: usize, code: Option<&str>, what: &str) {
    report.push(
        Stage::Ingest,
        FindingKind::InvalidGeometry,
        vec![],
        format!("{file} feature {index} ({}): {what}", code.unwrap_or("-")),
    );
}

fn point(feature: &Feature) -> Option<Point> {
    match feature_geometry(feature)? {
        Geometry::Point(p) if geometry::is_finite(p.0) => Some(p),
        Geometry::MultiPoint(mp) => mp.0.first().copied().filter(|p| geometry::is_finite(p.0)),
        _ => None,
    }
}

fn read_lines(dir: &Path, report: &mut Report) -> Result<Vec<InputLine>> {
    let mut out = Vec::new();
    for (i, f) in features(dir, LINKS_FILE)?.iter().enumerate() {
        let props = Properties::of(f);
        let code = props.str("code");
        let lines: Vec<_> = feature_geometry(f)
            .map(|g| geometry::explode_lines(&g))
            .unwrap_or_default()
            .iter()
            .filter_map(geometry::repair_linestring)
            .collect();
        if lines.is_empty() {
            dropped(report, LINKS_FILE, i, code.as_deref(), "not a valid linestring");
            continue;
        }
        out.push(InputLine {
            geometry: Geometry::MultiLineString(MultiLineString::new(lines)),
            code,
            name: props.str("name"),
        });
    }
    Ok(out)
}

fn read_structures(dir: &Path, report: &mut Report) -> Result<Vec<StructurePoint>> {
    let mut out = Vec::new();
    for (i, f) in features(dir, STRUCTURES_FILE)?.iter().enumerate() {
        let props = Properties::of(f);
        let code = props.str("code");
        let Some(geometry) = point(f) else {
            dropped(report, STRUCTURES_FILE, i, code.as_deref(), "not a point");
            continue;
        };
        let Some((node_type, function)) = structure_type(&props).filter(|(t, _)| t.is_connector()) else {
            report.push(
                Stage::Ingest,
                FindingKind::UnplacedStructure,
                vec![],
                format!("{STRUCTURES_FILE} feature {i} ({}): unknown structure type", code.as_deref().unwrap_or("-")),
            );
            continue;
        };
        let mut meta = props.meta();
        if let Some(function) = function {
            meta.entry(META_FUNCTION.to_string())
                .or_insert_with(|| MetaValue::Text(function.to_string()));
        }
        out.push(StructurePoint {
            geometry,
            node_type,
            code,
            name: props.str("name"),
            meta,
        });
    }
    Ok(out)
}

fn read_boundaries(dir: &Path, report: &mut Report) -> Result<Vec<BoundaryPoint>> {
    let path = dir.join(NODES_FILE);
    let mut out = Vec::new();
    for (i, f) in features(dir, NODES_FILE)?.iter().enumerate() {
        let props = Properties::of(f);
        let code = props.str("code");
        let Some(geometry) = point(f) else {
            dropped(report, NODES_FILE, i, code.as_deref(), "not a point");
            continue;
        };
        let node_type: NodeType = props
            .str("node_type")
            .unwrap_or_else(|| NodeType::LevelBoundary.as_str().to_string())
            .parse()
            .map_err(|e: String| Error::format(&path, format!("feature {i}: {e}")))?;
        if !node_type.is_boundary() {
            return Err(Error::format(&path, format!("feature {i}: {node_type} is not a boundary")));
        }
        out.push(BoundaryPoint {
            geometry,
            node_type,
            code,
            name: props.str("name"),
            meta: props.meta(),
        });
    }
    Ok(out)
}

fn read_polygons(dir: &Path, file: &str, report: &mut Report) -> Result<Vec<CandidateArea>> {
    let mut out = Vec::new();
    for (i, f) in features(dir, file)?.iter().enumerate() {
        let props = Properties::of(f);
        let code = props.str("code");
        let geometry = feature_geometry(f)
            .and_then(|g| polygon::to_multi(&g))
            .and_then(|mp| polygon::repair(&mp))
            .filter(|mp| !polygon::is_empty(mp));
        let Some(geometry) = geometry else {
            dropped(report, file, i, code.as_deref(), "not a valid polygon");
            continue;
        };
        out.push(CandidateArea {
            geometry,
            code,
            node_id: props.i64("node_id"),
            streefpeil: props.f64("streefpeil").or_else(|| props.f64(META_STREEFPEIL)),
        });
    }
    Ok(out)
}

fn read_profiles(dir: &Path, report: &mut Report) -> Result<Vec<ProfilePoint>> {
    let mut out = Vec::new();
    for (i, f) in features(dir, PROFILES_FILE)?.iter().enumerate() {
        let props = Properties::of(f);
        let Some(geometry) = point(f) else {
            dropped(report, PROFILES_FILE, i, props.str("code").as_deref(), "not a point");
            continue;
        };
        out.push(ProfilePoint {
            geometry,
            bottom_level: props.f64("bottom_level"),
            invert_level: props.f64("invert_level"),
        });
    }
    Ok(out)
}

impl Delivery {
    pub fn read(dir: &Path, report: &mut Report) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::format(dir, "delivery must be a directory"));
        }
        let second_layer = if dir.join(SECOND_LAYER_FILE).exists() {
            let areas = read_polygons(dir, SECOND_LAYER_FILE, report)?;
            Some(
                areas
                    .into_iter()
                    .filter_map(|a| {
                        let mut area = BasinArea::new(a.node_id?, a.geometry);
                        if let Some(level) = a.streefpeil {
                            area.meta
                                .insert(META_STREEFPEIL.to_string(), MetaValue::Float(level));
                        }
                        Some(area)
                    })
                    .collect(),
            )
        } else {
            None
        };
        let supply_area = if dir.join(SUPPLY_AREA_FILE).exists() {
            let parts = read_polygons(dir, SUPPLY_AREA_FILE, report)?;
            Some(polygon::union_all(parts.iter().map(|a| &a.geometry))).filter(|mp| !polygon::is_empty(mp))
        } else {
            None
        };
        let delivery = Self {
            lines: read_lines(dir, report)?,
            structures: read_structures(dir, report)?,
            boundaries: read_boundaries(dir, report)?,
            areas: read_polygons(dir, AREAS_FILE, report)?,
            second_layer,
            profiles: read_profiles(dir, report)?,
            supply_area,
        };
        info!(
            dir = %dir.display(),
            lines = delivery.lines.len(),
            structures = delivery.structures.len(),
            boundaries = delivery.boundaries.len(),
            areas = delivery.areas.len(),
            profiles = delivery.profiles.len(),
            supply_area = delivery.supply_area.is_some(),
            "Read delivery"
        );
        Ok(delivery)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::point;
    use super::test_support::*;
    use super::*;
    use crate::model::node::META_COUPLE_AUTHORITY;
    use serde_json::json;

    #[test]
    fn test_read_delivery() {
        let dir = std::env::temp_dir().join(format!("ribasim_nl_delivery_{}", uuid::Uuid::new_v4()));
        write_layer(
            &dir,
            LINKS_FILE,
            vec![
                line(&[(0.0, 0.0), (100.0, 0.0)], "W1"),
                json!({"type": "Feature", "geometry": null, "properties": {"code": "W2"}}),
            ],
        );
        write_layer(
            &dir,
            STRUCTURES_FILE,
            vec![
                point(50.0, 0.0, json!({"code": "KGM-1", "type": "Gemaal"})),
                point(60.0, 0.0, json!({"code": "KIN-1", "type": "inlaat"})),
                point(70.0, 0.0, json!({"code": "X", "type": "onbekend"})),
            ],
        );
        write_layer(
            &dir,
            NODES_FILE,
            vec![point(100.0, 0.0, json!({"node_type": "LevelBoundary", "meta_couple_authority": "Delfland"}))],
        );
        write_layer(&dir, AREAS_FILE, vec![square(0.0, -50.0, 100.0, json!({"code": "P1", "streefpeil": "-0.4"}))]);

        let mut report = Report::new();
        let delivery = Delivery::read(&dir, &mut report).unwrap();
        assert_eq!(delivery.lines.len(), 1);
        assert_eq!(delivery.structures.len(), 2);
        assert_eq!(delivery.structures[0].node_type, NodeType::Pump);
        assert_eq!(
            delivery.structures[1].meta.get(META_FUNCTION),
            Some(&MetaValue::Text("inlet".to_string()))
        );
        assert_eq!(
            delivery.boundaries[0].meta.get(META_COUPLE_AUTHORITY),
            Some(&MetaValue::Text("Delfland".to_string()))
        );
        assert_eq!(delivery.areas[0].streefpeil, Some(-0.4));
        assert!(delivery.profiles.is_empty());
        assert!(delivery.second_layer.is_none());
        assert!(delivery.supply_area.is_none());
        assert_eq!(report.count(FindingKind::InvalidGeometry), 1);
        assert_eq!(report.count(FindingKind::UnplacedStructure), 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_supply_area_is_dissolved() {
        let dir = std::env::temp_dir().join(format!("ribasim_nl_delivery_{}", uuid::Uuid::new_v4()));
        write_layer(
            &dir,
            SUPPLY_AREA_FILE,
            vec![square(0.0, 0.0, 100.0, json!({})), square(100.0, 0.0, 100.0, json!({}))],
        );
        let delivery = Delivery::read(&dir, &mut Report::new()).unwrap();
        let area = delivery.supply_area.unwrap();
        assert!((polygon::area(&area) - 20000.0).abs() < 1e-6);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_boundary_type_is_checked() {
        let dir = std::env::temp_dir().join(format!("ribasim_nl_delivery_{}", uuid::Uuid::new_v4()));
        write_layer(&dir, NODES_FILE, vec![point(0.0, 0.0, json!({"node_type": "Basin"}))]);
        assert!(matches!(Delivery::read(&dir, &mut Report::new()), Err(Error::Format { .. })));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
