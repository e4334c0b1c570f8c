//! Model bundle on disk: a JSON manifest, GeoJSON node/link/area layers and
//! one CSV per table. A bundle is only written for a model that passes full
//! validation, and every file is written through a temporary sibling.

pub mod csv_io;
pub mod geojson_io;
pub mod manifest;
pub mod store;

use crate::error::{Error, Result};
use crate::geometry::{self, polygon};
use crate::io_err;
use crate::model::{BasinArea, Link, LinkType, Model, Node, NodeType};
use crate::report::{Report, Stage};
use crate::validation::{self, Scope};
use geo_types::Geometry;
use geojson::{Feature, JsonObject, JsonValue};
use geojson_io::{Properties, feature, feature_geometry, insert_meta};
use manifest::Manifest;
use std::fs;
use std::path::Path;
use tracing::info;

pub const MANIFEST_FILE: &str = "ribasim.json";
pub const NODES_FILE: &str = "nodes.geojson";
pub const LINKS_FILE: &str = "links.geojson";
pub const BASIN_AREA_FILE: &str = "basin_area.geojson";
pub const REPORT_FILE: &str = "report.json";

/// Writes `bytes` to `<path>.tmp` and renames it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = Path::new(&tmp_name);
    fs::write(tmp, bytes).map_err(|e| io_err!(tmp, e))?;
    fs::rename(tmp, path).map_err(|e| io_err!(path, e))?;
    Ok(())
}

/// Validates and writes `model` into the bundle directory `dir`, with the
/// findings of `report` next to it.
pub fn write_model(model: &Model, dir: &Path, report: &Report) -> Result<()> {
    validation::ensure_valid(model, Scope::Full, Stage::Persist)?;
    let mut model = model.clone();
    model.normalize();

    fs::create_dir_all(dir).map_err(|e| io_err!(dir, e))?;

    let nodes = model.nodes.values().map(node_feature).collect();
    geojson_io::write_feature_collection(&dir.join(NODES_FILE), nodes)?;
    let links = model.links.values().map(link_feature).collect();
    geojson_io::write_feature_collection(&dir.join(LINKS_FILE), links)?;
    let areas = model.basin_areas.iter().map(area_feature).collect();
    geojson_io::write_feature_collection(&dir.join(BASIN_AREA_FILE), areas)?;

    let table_names = csv_io::write_tables(&model.tables, dir)?;
    Manifest::of(&model, table_names).write(&dir.join(MANIFEST_FILE))?;
    report.write_json(&dir.join(REPORT_FILE))?;

    info!(
        dir = %dir.display(),
        nodes = model.nodes.len(),
        links = model.links.len(),
        "Wrote model bundle"
    );
    Ok(())
}

/// Reads a bundle written by [`write_model`].
pub fn read_model(dir: &Path) -> Result<Model> {
    let manifest = Manifest::read(&dir.join(MANIFEST_FILE))?;
    let mut model = Model::new(manifest.crs());
    model.starttime = manifest.starttime;
    model.endtime = manifest.endtime;
    model.solver = manifest.solver.clone();

    let nodes_path = dir.join(NODES_FILE);
    for f in geojson_io::read_feature_collection(&nodes_path)?.features {
        let node = node_from_feature(&f, &nodes_path)?;
        model.nodes.insert(node.node_id, node);
    }
    let links_path = dir.join(LINKS_FILE);
    for f in geojson_io::read_feature_collection(&links_path)?.features {
        let link = link_from_feature(&f, &links_path)?;
        model.links.insert(link.link_id, link);
    }
    let area_path = dir.join(BASIN_AREA_FILE);
    if area_path.exists() {
        for f in geojson_io::read_feature_collection(&area_path)?.features {
            model.basin_areas.push(area_from_feature(&f, &area_path)?);
        }
    }
    model.tables = csv_io::read_tables(dir, &manifest.tables)?;
    model.normalize();
    Ok(model)
}

pub fn read_report(dir: &Path) -> Result<Report> {
    let path = dir.join(REPORT_FILE);
    if path.exists() {
        Report::read_json(&path)
    } else {
        Ok(Report::new())
    }
}

fn optional_str(value: &Option<String>) -> JsonValue {
    value
        .as_ref()
        .map(|s| JsonValue::String(s.clone()))
        .unwrap_or(JsonValue::Null)
}

fn node_feature(node: &Node) -> Feature {
    let mut props = JsonObject::new();
    props.insert("node_id".to_string(), JsonValue::from(node.node_id));
    props.insert("node_type".to_string(), JsonValue::from(node.node_type.as_str()));
    props.insert("name".to_string(), optional_str(&node.name));
    insert_meta(&mut props, &node.meta);
    feature(&Geometry::Point(node.geometry), props)
}

fn link_feature(link: &Link) -> Feature {
    let mut props = JsonObject::new();
    props.insert("link_id".to_string(), JsonValue::from(link.link_id));
    props.insert("from_node_id".to_string(), JsonValue::from(link.from_node_id));
    props.insert("to_node_id".to_string(), JsonValue::from(link.to_node_id));
    props.insert("link_type".to_string(), JsonValue::from(link.link_type.as_str()));
    props.insert("name".to_string(), optional_str(&link.name));
    insert_meta(&mut props, &link.meta);
    feature(&Geometry::LineString(link.geometry.clone()), props)
}

fn area_feature(area: &BasinArea) -> Feature {
    let mut props = JsonObject::new();
    props.insert("node_id".to_string(), JsonValue::from(area.node_id));
    insert_meta(&mut props, &area.meta);
    feature(&Geometry::MultiPolygon(area.geometry.clone()), props)
}

fn required_i64(props: &Properties, key: &str, path: &Path) -> Result<i64> {
    props
        .i64(key)
        .ok_or_else(|| Error::format(path, format!("feature without '{key}'")))
}

fn node_from_feature(f: &Feature, path: &Path) -> Result<Node> {
    let props = Properties::of(f);
    let node_id = required_i64(&props, "node_id", path)?;
    let node_type: NodeType = props
        .str("node_type")
        .ok_or_else(|| Error::format(path, format!("node {node_id} without node_type")))?
        .parse()
        .map_err(|e: String| Error::format(path, e))?;
    let Some(Geometry::Point(point)) = feature_geometry(f) else {
        return Err(Error::format(path, format!("node {node_id} is not a point")));
    };
    let mut node = Node::new(node_id, node_type, point);
    node.name = props.str("name");
    node.meta = props.meta();
    Ok(node)
}

fn link_from_feature(f: &Feature, path: &Path) -> Result<Link> {
    let props = Properties::of(f);
    let link_id = required_i64(&props, "link_id", path)?;
    let link_type: LinkType = props
        .str("link_type")
        .unwrap_or_else(|| "flow".to_string())
        .parse()
        .map_err(|e: String| Error::format(path, e))?;
    let Some(Geometry::LineString(geometry)) = feature_geometry(f) else {
        return Err(Error::format(path, format!("link {link_id} is not a linestring")));
    };
    Ok(Link {
        link_id,
        from_node_id: required_i64(&props, "from_node_id", path)?,
        to_node_id: required_i64(&props, "to_node_id", path)?,
        link_type,
        geometry,
        name: props.str("name"),
        meta: props.meta(),
    })
}

fn area_from_feature(f: &Feature, path: &Path) -> Result<BasinArea> {
    let props = Properties::of(f);
    let node_id = required_i64(&props, "node_id", path)?;
    let geometry = feature_geometry(f)
        .and_then(|g| polygon::to_multi(&g))
        .filter(|mp| !polygon::is_empty(mp))
        .ok_or_else(|| Error::format(path, format!("area of basin {node_id} is not a polygon")))?;
    let mut area = BasinArea::new(node_id, geometry);
    area.meta = props.meta();
    Ok(area)
}

/// Straight link geometries are recomputed from node positions after a
/// bundle is edited by hand; ends are snapped, interior vertices kept.
pub fn snap_link_geometries(model: &mut Model) {
    let coords: Vec<_> = model
        .links
        .values()
        .map(|l| (l.link_id, model.node_coord(l.from_node_id), model.node_coord(l.to_node_id)))
        .collect();
    for (link_id, from, to) in coords {
        if let (Some(a), Some(b), Some(link)) = (from, to, model.links.get_mut(&link_id)) {
            link.geometry = geometry::snap_line_ends(&link.geometry, a, b);
        }
    }
}
