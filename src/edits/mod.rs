//! Edit scripts: ordered layers of structural operations on a model. Each
//! layer is named after an operation; each feature is one invocation whose
//! properties are the arguments.

use crate::basin_area::AreaOverride;
use crate::error::{Error, Result};
use crate::geometry::{LineString, MultiPolygon, Point, polygon};
use crate::io_err;
use crate::model::{LinkId, Meta, Model, NodeId, NodeType, node::META_STREEFPEIL};
use crate::persistence::geojson_io::{Properties, feature_collection_from_value, feature_geometry};
use geo_types::Geometry;
use geojson::{Feature, JsonValue};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub enum EditOperation {
    RemoveNode {
        node_id: NodeId,
    },
    RemoveLink {
        link_id: LinkId,
    },
    AddBasin {
        geometry: Option<Point>,
        area: Option<MultiPolygon>,
        name: Option<String>,
        meta: Meta,
    },
    AddBasinArea {
        node_id: Option<NodeId>,
        geometry: Option<MultiPolygon>,
        add_area_code: Option<String>,
        meta: Meta,
    },
    UpdateBasinArea {
        node_id: NodeId,
        geometry: MultiPolygon,
        meta: Meta,
    },
    RemoveBasinArea {
        node_id: NodeId,
    },
    MergeBasins {
        basin_id: NodeId,
        to_basin_id: NodeId,
        are_connected: bool,
    },
    ReverseLink {
        link_id: LinkId,
    },
    RedirectLink {
        link_id: LinkId,
        from_node_id: Option<NodeId>,
        to_node_id: Option<NodeId>,
    },
    MoveNode {
        node_id: NodeId,
        geometry: Point,
    },
    UpdateNode {
        node_id: NodeId,
        node_type: NodeType,
    },
    ConnectBasins {
        from_basin_id: NodeId,
        to_basin_id: NodeId,
        node_type: NodeType,
    },
    DeactivateNode {
        node_id: NodeId,
    },
    SplitBasin {
        basin_id: Option<NodeId>,
        line: LineString,
    },
}

impl EditOperation {
    pub const NAMES: &'static [&'static str] = &[
        "remove_node",
        "remove_link",
        "add_basin",
        "add_basin_area",
        "update_basin_area",
        "remove_basin_area",
        "merge_basins",
        "reverse_link",
        "redirect_link",
        "move_node",
        "update_node",
        "connect_basins",
        "deactivate_node",
        "split_basin",
    ];

    /// Area overrides are resolved together with the delivered areas, not
    /// applied as a structural edit.
    pub fn as_area_override(&self) -> Option<AreaOverride> {
        match self {
            EditOperation::AddBasinArea {
                node_id: Some(node_id),
                geometry: None,
                add_area_code: Some(code),
                ..
            } => Some(AreaOverride {
                node_id: *node_id,
                add_area_code: code.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditStep {
    pub layer: String,
    pub row: usize,
    pub operation: EditOperation,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditScript {
    pub steps: Vec<EditStep>,
}

#[derive(Deserialize)]
struct RawLayer {
    layer: String,
    features: JsonValue,
}

/// Argument lookup for one row, with errors naming the layer and the row.
struct Row<'a> {
    layer: &'a str,
    row: usize,
    path: &'a Path,
    props: Properties<'a>,
    geometry: Option<Geometry<f64>>,
}

impl Row<'_> {
    fn missing(&self, what: &str) -> Error {
        Error::format(
            self.path,
            format!("layer '{}' row {}: missing or invalid '{what}'", self.layer, self.row),
        )
    }

    fn id(&self, key: &str) -> Result<i64> {
        self.props.i64(key).ok_or_else(|| self.missing(key))
    }

    fn opt_id(&self, key: &str) -> Option<i64> {
        self.props.i64(key)
    }

    fn node_type(&self, key: &str) -> Result<Option<NodeType>> {
        match self.props.str(key) {
            None => Ok(None),
            Some(s) => s.parse().map(Some).map_err(|_| self.missing(key)),
        }
    }

    fn point(&self) -> Option<Point> {
        match &self.geometry {
            Some(Geometry::Point(p)) => Some(*p),
            Some(Geometry::MultiPoint(mp)) if mp.0.len() == 1 => Some(mp.0[0]),
            _ => None,
        }
    }

    fn polygon(&self) -> Option<MultiPolygon> {
        self.geometry.as_ref().and_then(polygon::to_multi)
    }

    fn line(&self) -> Option<LineString> {
        match &self.geometry {
            Some(Geometry::LineString(l)) => Some(l.clone()),
            Some(Geometry::MultiLineString(ml)) if ml.0.len() == 1 => Some(ml.0[0].clone()),
            _ => None,
        }
    }
}

fn parse_row(layer: &str, row: usize, feature: &Feature, path: &Path) -> Result<EditOperation> {
    let r = Row {
        layer,
        row,
        path,
        props: Properties::of(feature),
        geometry: feature_geometry(feature),
    };
    let op = match layer {
        "remove_node" => EditOperation::RemoveNode { node_id: r.id("node_id")? },
        "remove_link" => EditOperation::RemoveLink { link_id: r.id("link_id")? },
        "add_basin" => {
            let (geometry, area) = (r.point(), r.polygon());
            if geometry.is_none() && area.is_none() {
                return Err(r.missing("geometry"));
            }
            EditOperation::AddBasin {
                geometry,
                area,
                name: r.props.str("name"),
                meta: r.props.meta(),
            }
        }
        "add_basin_area" => {
            let op = EditOperation::AddBasinArea {
                node_id: r.opt_id("node_id"),
                geometry: r.polygon(),
                add_area_code: r.props.str("add_area_code"),
                meta: r.props.meta(),
            };
            if let EditOperation::AddBasinArea { node_id: None, .. } = &op {
                return Err(r.missing("node_id"));
            }
            if let EditOperation::AddBasinArea { geometry: None, add_area_code: None, .. } = &op {
                return Err(r.missing("geometry"));
            }
            op
        }
        "update_basin_area" => EditOperation::UpdateBasinArea {
            node_id: r.id("node_id")?,
            geometry: r.polygon().ok_or_else(|| r.missing("geometry"))?,
            meta: r.props.meta(),
        },
        "remove_basin_area" => EditOperation::RemoveBasinArea { node_id: r.id("node_id")? },
        "merge_basins" => EditOperation::MergeBasins {
            basin_id: r.id("basin_id")?,
            to_basin_id: r.id("to_basin_id")?,
            are_connected: r.props.bool("are_connected").unwrap_or(true),
        },
        "reverse_link" => EditOperation::ReverseLink { link_id: r.id("link_id")? },
        "redirect_link" => {
            let (from_node_id, to_node_id) = (r.opt_id("from_node_id"), r.opt_id("to_node_id"));
            if from_node_id.is_none() && to_node_id.is_none() {
                return Err(r.missing("from_node_id"));
            }
            EditOperation::RedirectLink {
                link_id: r.id("link_id")?,
                from_node_id,
                to_node_id,
            }
        }
        "move_node" => EditOperation::MoveNode {
            node_id: r.id("node_id")?,
            geometry: r.point().ok_or_else(|| r.missing("geometry"))?,
        },
        "update_node" => EditOperation::UpdateNode {
            node_id: r.id("node_id")?,
            node_type: r.node_type("node_type")?.ok_or_else(|| r.missing("node_type"))?,
        },
        "connect_basins" => EditOperation::ConnectBasins {
            from_basin_id: r.id("from_basin_id")?,
            to_basin_id: r.id("to_basin_id")?,
            node_type: r.node_type("node_type")?.unwrap_or(NodeType::ManningResistance),
        },
        "deactivate_node" => EditOperation::DeactivateNode { node_id: r.id("node_id")? },
        "split_basin" => EditOperation::SplitBasin {
            basin_id: r.opt_id("basin_id"),
            line: r.line().ok_or_else(|| r.missing("geometry"))?,
        },
        other => {
            return Err(Error::format(
                path,
                format!("unknown edit operation '{other}', expected one of {:?}", EditOperation::NAMES),
            ));
        }
    };
    Ok(op)
}

impl EditScript {
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| io_err!(path, e))?;
        let value: JsonValue = serde_json::from_str(&text).map_err(|e| Error::format(path, e))?;
        Self::from_json(value, path)
    }

    /// Parses `[{ "layer": .., "features": FeatureCollection }, ..]`.
    /// `path` only labels errors.
    pub fn from_json(value: JsonValue, path: &Path) -> Result<Self> {
        let layers: Vec<RawLayer> = serde_json::from_value(value).map_err(|e| Error::format(path, e))?;
        let mut steps = Vec::new();
        for raw in layers {
            let fc = feature_collection_from_value(raw.features, path)?;
            for (row, feature) in fc.features.iter().enumerate() {
                let operation = parse_row(&raw.layer, row, feature, path)?;
                steps.push(EditStep {
                    layer: raw.layer.clone(),
                    row,
                    operation,
                });
            }
        }
        Ok(Self { steps })
    }

    /// Optional script next to the deliveries; absent means no edits.
    pub fn read_optional(path: PathBuf) -> Result<Self> {
        if path.exists() { Self::read(&path) } else { Ok(Self::default()) }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn area_overrides(&self) -> Vec<AreaOverride> {
        self.steps
            .iter()
            .filter_map(|s| s.operation.as_area_override())
            .collect()
    }

    /// Applies every step in order. An edit that refers to a missing node
    /// or link aborts the script.
    pub fn apply(&self, model: &mut Model) -> Result<()> {
        for step in &self.steps {
            if step.operation.as_area_override().is_some() {
                continue;
            }
            debug!(layer = %step.layer, row = step.row, "Applying edit");
            apply_operation(model, &step.operation)?;
        }
        if !self.steps.is_empty() {
            info!(steps = self.steps.len(), "Applied edit script");
        }
        Ok(())
    }
}

fn apply_operation(model: &mut Model, op: &EditOperation) -> Result<()> {
    match op {
        EditOperation::RemoveNode { node_id } => model.remove_node_checked(*node_id),
        EditOperation::RemoveLink { link_id } => model.remove_link_checked(*link_id).map(|_| ()),
        EditOperation::AddBasin {
            geometry,
            area,
            name,
            meta,
        } => {
            let node_id = model.add_basin(*geometry, area.clone(), meta.clone())?;
            if let Some(node) = model.node_mut(node_id) {
                node.name = name.clone();
            }
            Ok(())
        }
        EditOperation::AddBasinArea {
            node_id,
            geometry,
            meta,
            ..
        } => match (node_id, geometry) {
            (Some(node_id), Some(geometry)) => model.add_basin_area(*node_id, geometry.clone(), meta.clone()),
            _ => Ok(()),
        },
        EditOperation::UpdateBasinArea {
            node_id,
            geometry,
            meta,
        } => {
            let mut meta = meta.clone();
            if !meta.contains_key(META_STREEFPEIL) {
                if let Some(level) = model.basin_area(*node_id).and_then(|a| a.streefpeil()) {
                    meta.insert(META_STREEFPEIL.to_string(), level.into());
                }
            }
            model.update_basin_area(*node_id, geometry.clone(), meta)
        }
        EditOperation::RemoveBasinArea { node_id } => model.remove_basin_area(*node_id),
        EditOperation::MergeBasins {
            basin_id,
            to_basin_id,
            are_connected,
        } => model.merge_basins(*basin_id, *to_basin_id, *are_connected),
        EditOperation::ReverseLink { link_id } => model.reverse_link(*link_id),
        EditOperation::RedirectLink {
            link_id,
            from_node_id,
            to_node_id,
        } => model.redirect_link(*link_id, *from_node_id, *to_node_id),
        EditOperation::MoveNode { node_id, geometry } => model.move_node(*node_id, *geometry),
        EditOperation::UpdateNode { node_id, node_type } => model.update_node(*node_id, *node_type),
        EditOperation::ConnectBasins {
            from_basin_id,
            to_basin_id,
            node_type,
        } => model
            .connect_basins(*from_basin_id, *to_basin_id, *node_type)
            .map(|_| ()),
        EditOperation::DeactivateNode { node_id } => model.deactivate_node(*node_id),
        EditOperation::SplitBasin { basin_id, line } => model.split_basin(*basin_id, line).map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::*;
    use serde_json::json;

    fn script(value: JsonValue) -> Result<EditScript> {
        EditScript::from_json(value, Path::new("edits.json"))
    }

    fn point_feature(x: f64, y: f64, props: JsonValue) -> JsonValue {
        json!({"type": "Feature", "geometry": {"type": "Point", "coordinates": [x, y]}, "properties": props})
    }

    fn layer(name: &str, features: Vec<JsonValue>) -> JsonValue {
        json!({"layer": name, "features": {"type": "FeatureCollection", "features": features}})
    }

    #[test]
    fn test_layers_run_in_array_order() {
        let s = script(json!([
            layer("update_node", vec![point_feature(0.0, 0.0, json!({"node_id": 2, "node_type": "Outlet", "unused": "x"}))]),
            layer("move_node", vec![point_feature(100.0, 40.0, json!({"node_id": 2}))]),
            layer("update_node", vec![point_feature(0.0, 0.0, json!({"node_id": 2, "node_type": "Pump"}))]),
        ]))
        .unwrap();
        assert_eq!(s.steps.len(), 3);

        let mut model = two_basin_chain();
        s.apply(&mut model).unwrap();
        assert_eq!(model.node_type(2), Some(NodeType::Pump));
        assert_eq!(model.node_coord(2).map(|c| c.y), Some(40.0));
        assert_eq!(model.tables.pump_static.len(), 1);
        assert_eq!(model.tables.pump_static[0].flow_rate, 1.0);
        assert!(model.tables.outlet_static.is_empty());
    }

    #[test]
    fn test_missing_argument_names_layer_and_row() {
        let err = script(json!([
            layer("remove_node", vec![
                point_feature(0.0, 0.0, json!({"node_id": 1})),
                point_feature(0.0, 0.0, json!({"name": "no id"})),
            ]),
        ]))
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("remove_node"), "{message}");
        assert!(message.contains("row 1"), "{message}");
    }

    #[test]
    fn test_unknown_layer_is_rejected() {
        assert!(matches!(
            script(json!([layer("explode_basin", vec![point_feature(0.0, 0.0, json!({}))])])),
            Err(Error::Format { .. })
        ));
    }

    #[test]
    fn test_area_code_override_is_not_applied_as_edit() {
        let s = script(json!([
            layer("add_basin_area", vec![json!({
                "type": "Feature", "geometry": null,
                "properties": {"node_id": 3, "add_area_code": "PG-12"}
            })]),
        ]))
        .unwrap();
        assert_eq!(
            s.area_overrides(),
            vec![AreaOverride {
                node_id: 3,
                add_area_code: "PG-12".to_string()
            }]
        );
        let mut model = two_basin_chain();
        s.apply(&mut model).unwrap();
        assert!(model.basin_areas.is_empty());
    }

    #[test]
    fn test_edit_on_missing_node_fails() {
        let s = script(json!([layer("remove_node", vec![point_feature(0.0, 0.0, json!({"node_id": 42}))])])).unwrap();
        let mut model = two_basin_chain();
        assert!(matches!(
            s.apply(&mut model),
            Err(Error::Topology { .. })
        ));
    }

    #[test]
    fn test_connect_basins_defaults_to_manning() {
        let s = script(json!([
            layer("add_basin", vec![point_feature(200.0, 200.0, json!({"name": "Boezem", "meta_categorie": "hoofdwater"}))]),
            layer("connect_basins", vec![point_feature(0.0, 0.0, json!({"from_basin_id": 3, "to_basin_id": 4}))]),
        ]))
        .unwrap();
        let mut model = two_basin_chain();
        s.apply(&mut model).unwrap();
        assert_eq!(model.node(4).and_then(|n| n.name.as_deref()), Some("Boezem"));
        assert_eq!(model.node_type(5), Some(NodeType::ManningResistance));
        assert_eq!(model.downstream_node_ids(5), vec![4]);
    }
}
