//! Target levels (streefpeil) of basins and the weir-controlled flag.

use super::conversions::round_to_precision;
use crate::model::node::{META_CODE, META_GESTUWD};
use crate::model::{Adjacency, MetaValue, Model, NodeId, NodeType};
use crate::report::{FindingKind, Report, Stage};
use geo::Contains;
use geo_types::Point;
use std::collections::BTreeSet;
use tracing::debug;

/// Measured cross-section point: bottom and embankment (invert) level.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfilePoint {
    pub geometry: Point,
    pub bottom_level: Option<f64>,
    pub invert_level: Option<f64>,
}

/// Lowest target level of the basins directly upstream of a connector.
pub fn upstream_target_level(model: &Model, node_id: NodeId) -> Option<f64> {
    model
        .upstream_node_ids(node_id)
        .into_iter()
        .filter(|id| model.node_type(*id) == Some(NodeType::Basin))
        .filter_map(|id| model.target_level(id))
        .reduce(f64::min)
}

/// Lowest target level of the basins directly downstream of a connector.
pub fn downstream_target_level(model: &Model, node_id: NodeId) -> Option<f64> {
    model
        .downstream_node_ids(node_id)
        .into_iter()
        .filter(|id| model.node_type(*id) == Some(NodeType::Basin))
        .filter_map(|id| model.target_level(id))
        .reduce(f64::min)
}

fn from_downstream_structures(model: &Model, adj: &Adjacency, basin_id: NodeId) -> Option<f64> {
    adj.flow_out(basin_id)
        .iter()
        .filter_map(|l| model.link(*l))
        .filter_map(|l| {
            let node_type = model.node_type(l.to_node_id)?;
            let rows = model.tables.structure_static(node_type)?;
            rows.iter()
                .filter(|r| r.node_id == l.to_node_id)
                .filter_map(|r| r.min_upstream_level)
                .reduce(f64::min)
        })
        .reduce(f64::min)
}

fn from_profiles(model: &Model, basin_id: NodeId, profiles: &[ProfilePoint]) -> Option<f64> {
    let area = model.basin_area(basin_id)?;
    let levels: Vec<f64> = profiles
        .iter()
        .filter(|p| area.geometry.contains(&p.geometry))
        .filter_map(|p| Some((p.bottom_level? + p.invert_level?) / 2.0))
        .filter(|v| v.is_finite())
        .collect();
    if levels.is_empty() {
        None
    } else {
        Some(levels.iter().sum::<f64>() / levels.len() as f64)
    }
}

/// Fills missing basin target levels: first from the `min_upstream_level`
/// of the structures draining the basin, then from the mean of measured
/// bottom and invert levels inside its area. Returns the number filled.
pub fn propagate_target_levels(model: &mut Model, profiles: &[ProfilePoint], report: &mut Report) -> usize {
    let adj = model.adjacency();
    let mut filled = Vec::new();
    for basin_id in model.node_ids_of_type(NodeType::Basin) {
        if model.target_level(basin_id).is_some() {
            continue;
        }
        let level = from_downstream_structures(model, &adj, basin_id)
            .or_else(|| from_profiles(model, basin_id, profiles));
        match level {
            Some(level) => filled.push((basin_id, round_to_precision(level, 0.01))),
            None => report.push(
                Stage::Parametrization,
                FindingKind::MissingParameter,
                vec![basin_id],
                "basin has no target level",
            ),
        }
    }
    let count = filled.len();
    for (basin_id, level) in filled {
        debug!(basin_id, level, "Derived target level");
        model.set_target_level(basin_id, level);
    }
    count
}

/// Structures that hold water up: every pump, and outlets whose code marks
/// a weir (`KST`) or pumping station (`GEM_`).
pub fn is_weir_controlled(node_type: NodeType, code: Option<&str>) -> bool {
    match node_type {
        NodeType::Pump => true,
        NodeType::Outlet | NodeType::TabulatedRatingCurve => {
            code.is_some_and(|c| c.starts_with("KST") || c.starts_with("GEM_"))
        }
        _ => false,
    }
}

/// Sets `meta_gestuwd` on structures and basins: marked structures, the
/// basins directly upstream of them, and every outlet directly downstream
/// of such a basin. The cascade is one step deep.
pub fn propagate_gestuwd(model: &mut Model) -> usize {
    let structures: BTreeSet<NodeId> = model
        .nodes
        .values()
        .filter(|n| is_weir_controlled(n.node_type, n.meta_str(META_CODE)))
        .map(|n| n.node_id)
        .collect();
    let basins: BTreeSet<NodeId> = structures
        .iter()
        .flat_map(|id| model.upstream_node_ids(*id))
        .filter(|id| model.node_type(*id) == Some(NodeType::Basin))
        .collect();
    let outlets: BTreeSet<NodeId> = basins
        .iter()
        .flat_map(|id| model.downstream_node_ids(*id))
        .filter(|id| model.node_type(*id) == Some(NodeType::Outlet))
        .collect();

    let mut count = 0;
    for node in model.nodes.values_mut() {
        let flagged = match node.node_type {
            NodeType::Basin => basins.contains(&node.node_id),
            NodeType::Pump => true,
            NodeType::Outlet | NodeType::TabulatedRatingCurve => {
                structures.contains(&node.node_id) || outlets.contains(&node.node_id)
            }
            _ => continue,
        };
        count += usize::from(flagged);
        node.meta
            .insert(META_GESTUWD.to_string(), MetaValue::Bool(flagged));
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::*;
    use crate::model::{BasinArea, LinkType};
    use crate::model::tables::StructureStatic;
    use geo_types::{MultiPolygon, polygon};

    #[test]
    fn test_target_level_from_structure() {
        let mut model = two_basin_chain();
        model.tables.pump_static[0].min_upstream_level = Some(-0.456);
        let mut report = Report::new();
        assert_eq!(propagate_target_levels(&mut model, &[], &mut report), 1);
        assert_eq!(model.target_level(1), Some(-0.46));
        assert_eq!(report.count(FindingKind::MissingParameter), 1);
        assert_eq!(upstream_target_level(&model, 2), Some(-0.46));
        assert_eq!(downstream_target_level(&model, 2), None);
    }

    #[test]
    fn test_target_level_from_profiles() {
        let mut model = two_basin_chain();
        model.basin_areas.push(BasinArea::new(
            3,
            MultiPolygon::new(vec![polygon![(x: 150.0, y: -50.0), (x: 250.0, y: -50.0), (x: 250.0, y: 50.0), (x: 150.0, y: 50.0)]]),
        ));
        let profiles = vec![
            ProfilePoint { geometry: pt(200.0, 0.0), bottom_level: Some(-2.0), invert_level: Some(1.0) },
            ProfilePoint { geometry: pt(210.0, 0.0), bottom_level: Some(-1.0), invert_level: Some(1.0) },
            ProfilePoint { geometry: pt(900.0, 0.0), bottom_level: Some(5.0), invert_level: Some(5.0) },
        ];
        propagate_target_levels(&mut model, &profiles, &mut Report::new());
        assert_eq!(model.target_level(3), Some(-0.25));
    }

    #[test]
    fn test_gestuwd_cascades_one_step() {
        // Basin 1 -> Pump 2 -> Basin 3, plus Basin 1 -> Outlet 4 -> Basin 5 -> Outlet 6 -> Basin 7
        let mut model = two_basin_chain();
        let o4 = model.add_node(NodeType::Outlet, pt(0.0, 100.0));
        let b5 = model.add_node(NodeType::Basin, pt(0.0, 200.0));
        let o6 = model.add_node(NodeType::Outlet, pt(0.0, 300.0));
        let b7 = model.add_node(NodeType::Basin, pt(0.0, 400.0));
        for (a, b) in [(1, o4), (o4, b5), (b5, o6), (o6, b7)] {
            model.add_link(a, b, LinkType::Flow).unwrap();
        }
        for o in [o4, o6] {
            model.tables.outlet_static.push(StructureStatic::new(o, 1.0));
        }
        propagate_gestuwd(&mut model);
        let flag = |id| model.node(id).and_then(|n| n.meta_bool(META_GESTUWD));
        assert_eq!(flag(1), Some(true));
        assert_eq!(flag(2), Some(true));
        assert_eq!(flag(3), Some(false));
        assert_eq!(flag(o4), Some(true));
        assert_eq!(flag(b5), Some(false));
        assert_eq!(flag(o6), Some(false));
    }
}
