//! Enumerates topology and table defects of a model. Repairs live in
//! [`repair`].

pub mod repair;

use crate::basin_area::overlapping_pairs;
use crate::error::{Error, Result};
use crate::geometry::{self, index::PointIndex};
use crate::model::{LinkId, LinkType, Model, NodeId, NodeType};
use crate::report::Stage;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// Link ends farther than this from their node are a mismatch (m).
pub const ENDPOINT_TOLERANCE: f64 = 0.01;
/// Basin areas may overlap by at most this much (m²).
pub const OVERLAP_TOLERANCE: f64 = 0.1;
/// Distinct nodes closer than this are reported (m).
pub const OVERLAPPING_NODE_DISTANCE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Graph, adjacency and basin-area checks
    Topology,
    /// Topology plus profile, state and static-table checks
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "defect", rename_all = "snake_case")]
pub enum Defect {
    DuplicateLink { link_ids: Vec<LinkId>, from_node_id: NodeId, to_node_id: NodeId },
    MissingNode { link_id: LinkId, node_id: NodeId },
    SelfLoop { link_id: LinkId, node_id: NodeId },
    LinkEndpointMismatch { link_id: LinkId, distance: f64 },
    /// Connector without a node on one side, or with the same basin on both
    InvalidConnectivity { node_id: NodeId, reason: String },
    IncorrectTypeConnectivity { link_id: LinkId, from_type: NodeType, to_type: NodeType },
    InvalidControlLink { link_id: LinkId },
    InternalBasin { node_id: NodeId },
    UnassignedBasinArea { node_id: NodeId },
    OverlappingBasinAreas { node_ids: (NodeId, NodeId), area: f64 },
    MissingProfile { node_id: NodeId },
    InvalidProfile { node_id: NodeId, reason: String },
    MissingState { node_id: NodeId },
    StateOutOfRange { node_id: NodeId, level: f64 },
    MissingStatic { node_id: NodeId, node_type: NodeType },
    InvalidRatingCurve { node_id: NodeId },
    OrphanTableRow { table: String, node_id: NodeId },
    /// Diagnostic only
    OverlappingNodes { node_ids: (NodeId, NodeId), distance: f64 },
}

impl Defect {
    /// Defects that block a write. Overlapping nodes are a diagnostic.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Defect::OverlappingNodes { .. })
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        match self {
            Defect::DuplicateLink { from_node_id, to_node_id, .. } => vec![*from_node_id, *to_node_id],
            Defect::MissingNode { node_id, .. }
            | Defect::SelfLoop { node_id, .. }
            | Defect::InvalidConnectivity { node_id, .. }
            | Defect::InternalBasin { node_id }
            | Defect::UnassignedBasinArea { node_id }
            | Defect::MissingProfile { node_id }
            | Defect::InvalidProfile { node_id, .. }
            | Defect::MissingState { node_id }
            | Defect::StateOutOfRange { node_id, .. }
            | Defect::MissingStatic { node_id, .. }
            | Defect::InvalidRatingCurve { node_id }
            | Defect::OrphanTableRow { node_id, .. } => vec![*node_id],
            Defect::OverlappingBasinAreas { node_ids, .. } | Defect::OverlappingNodes { node_ids, .. } => {
                vec![node_ids.0, node_ids.1]
            }
            Defect::LinkEndpointMismatch { .. }
            | Defect::IncorrectTypeConnectivity { .. }
            | Defect::InvalidControlLink { .. } => vec![],
        }
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Defect::DuplicateLink { link_ids, from_node_id, to_node_id } => {
                write!(f, "duplicate links {link_ids:?} from {from_node_id} to {to_node_id}")
            }
            Defect::MissingNode { link_id, node_id } => write!(f, "link {link_id} references missing node {node_id}"),
            Defect::SelfLoop { link_id, node_id } => write!(f, "link {link_id} loops on node {node_id}"),
            Defect::LinkEndpointMismatch { link_id, distance } => {
                write!(f, "link {link_id} ends {distance:.3} m from its node")
            }
            Defect::InvalidConnectivity { node_id, reason } => write!(f, "connector {node_id}: {reason}"),
            Defect::IncorrectTypeConnectivity { link_id, from_type, to_type } => {
                write!(f, "link {link_id} connects {from_type} to {to_type}")
            }
            Defect::InvalidControlLink { link_id } => {
                write!(f, "control link {link_id} does not run from a control node to a Pump or Outlet")
            }
            Defect::InternalBasin { node_id } => write!(f, "basin {node_id} has no path to a downstream boundary"),
            Defect::UnassignedBasinArea { node_id } => write!(f, "basin area of {node_id} has no basin node"),
            Defect::OverlappingBasinAreas { node_ids, area } => {
                write!(f, "basin areas {} and {} overlap by {area:.2} m²", node_ids.0, node_ids.1)
            }
            Defect::MissingProfile { node_id } => write!(f, "basin {node_id} has no profile"),
            Defect::InvalidProfile { node_id, reason } => write!(f, "profile of basin {node_id}: {reason}"),
            Defect::MissingState { node_id } => write!(f, "basin {node_id} has no state"),
            Defect::StateOutOfRange { node_id, level } => {
                write!(f, "state level {level} of basin {node_id} is outside its profile")
            }
            Defect::MissingStatic { node_id, node_type } => write!(f, "{node_type} {node_id} has no static row"),
            Defect::InvalidRatingCurve { node_id } => write!(f, "rating curve of {node_id} is not monotonic"),
            Defect::OrphanTableRow { table, node_id } => {
                write!(f, "{table} row of node {node_id} has no matching node")
            }
            Defect::OverlappingNodes { node_ids, distance } => {
                write!(f, "nodes {} and {} are {distance:.2} m apart", node_ids.0, node_ids.1)
            }
        }
    }
}

/// Whether a flow link from `from` to `to` is allowed.
pub fn flow_link_allowed(from: NodeType, to: NodeType) -> bool {
    use NodeType::*;
    if from.is_control() || to.is_control() {
        return false;
    }
    match (from, to) {
        (Basin, t) | (t, Basin) => t.is_connector() || t == Junction,
        (FlowBoundary | LevelBoundary, t) => t.may_touch_boundary(),
        (t, LevelBoundary | Terminal) => t.may_touch_boundary(),
        (Junction, t) | (t, Junction) => t.is_connector() || t == Junction,
        _ => false,
    }
}

/// Node type expected to own the rows of a table.
pub fn table_owner_type(table: &str) -> Option<NodeType> {
    Some(match table {
        "basin_profile" | "basin_state" | "basin_static" | "basin_time" => NodeType::Basin,
        "pump_static" => NodeType::Pump,
        "outlet_static" => NodeType::Outlet,
        "manning_resistance_static" => NodeType::ManningResistance,
        "linear_resistance_static" => NodeType::LinearResistance,
        "tabulated_rating_curve_static" => NodeType::TabulatedRatingCurve,
        "level_boundary_static" => NodeType::LevelBoundary,
        "flow_boundary_static" => NodeType::FlowBoundary,
        "discrete_control_variable" | "discrete_control_condition" | "discrete_control_logic" => {
            NodeType::DiscreteControl
        }
        "continuous_control_variable" | "continuous_control_function" => NodeType::ContinuousControl,
        "pid_control_static" => NodeType::PidControl,
        _ => return None,
    })
}

/// All defects of `model`, in a stable order.
pub fn validate(model: &Model, scope: Scope) -> Vec<Defect> {
    let mut defects = Vec::new();
    check_links(model, &mut defects);
    check_connectivity(model, &mut defects);
    check_internal_basins(model, &mut defects);
    check_basin_areas(model, &mut defects);
    check_overlapping_nodes(model, &mut defects);
    if scope == Scope::Full {
        check_basin_tables(model, &mut defects);
        check_static_tables(model, &mut defects);
    }
    defects
}

/// `Validation` error carrying the fatal defects, if there are any.
pub fn ensure_valid(model: &Model, scope: Scope, stage: Stage) -> Result<()> {
    let defects: Vec<Defect> = validate(model, scope).into_iter().filter(Defect::is_fatal).collect();
    if defects.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation { stage, defects })
    }
}

fn check_links(model: &Model, defects: &mut Vec<Defect>) {
    let mut by_pair: BTreeMap<(NodeId, NodeId, LinkType), Vec<LinkId>> = BTreeMap::new();
    for link in model.links.values() {
        let mut complete = true;
        for node_id in [link.from_node_id, link.to_node_id] {
            if !model.nodes.contains_key(&node_id) {
                defects.push(Defect::MissingNode { link_id: link.link_id, node_id });
                complete = false;
            }
        }
        if link.from_node_id == link.to_node_id {
            defects.push(Defect::SelfLoop {
                link_id: link.link_id,
                node_id: link.from_node_id,
            });
            continue;
        }
        if !complete {
            continue;
        }
        by_pair
            .entry((link.from_node_id, link.to_node_id, link.link_type))
            .or_default()
            .push(link.link_id);

        if let (Some((start, end)), Some(a), Some(b)) = (
            geometry::endpoints(&link.geometry),
            model.node_coord(link.from_node_id),
            model.node_coord(link.to_node_id),
        ) {
            let distance = geometry::distance(start, a).max(geometry::distance(end, b));
            if distance > ENDPOINT_TOLERANCE {
                defects.push(Defect::LinkEndpointMismatch {
                    link_id: link.link_id,
                    distance,
                });
            }
        }

        let (Some(from_type), Some(to_type)) = (model.node_type(link.from_node_id), model.node_type(link.to_node_id))
        else {
            continue;
        };
        match link.link_type {
            LinkType::Flow => {
                if !flow_link_allowed(from_type, to_type) {
                    defects.push(Defect::IncorrectTypeConnectivity {
                        link_id: link.link_id,
                        from_type,
                        to_type,
                    });
                }
            }
            LinkType::Control => {
                if !from_type.is_control() || !to_type.is_controllable() {
                    defects.push(Defect::InvalidControlLink { link_id: link.link_id });
                }
            }
        }
    }
    for ((from_node_id, to_node_id, _), link_ids) in by_pair {
        if link_ids.len() > 1 {
            defects.push(Defect::DuplicateLink {
                link_ids,
                from_node_id,
                to_node_id,
            });
        }
    }
}

fn check_connectivity(model: &Model, defects: &mut Vec<Defect>) {
    for node in model.nodes.values().filter(|n| n.node_type.is_connector()) {
        let upstream = model.upstream_node_ids(node.node_id);
        let downstream = model.downstream_node_ids(node.node_id);
        let reason = match (upstream.as_slice(), downstream.as_slice()) {
            ([], []) => Some("has no flow links".to_string()),
            ([], _) => Some("has no upstream node".to_string()),
            (_, []) => Some("has no downstream node".to_string()),
            ([up], [down]) if up == down => Some(format!("connects basin {up} to itself")),
            _ => None,
        };
        if let Some(reason) = reason {
            defects.push(Defect::InvalidConnectivity {
                node_id: node.node_id,
                reason,
            });
        }
    }
}

/// Basins from which no boundary and no flow sink can be reached. Isolated
/// basins are internal as well.
pub fn internal_basins(model: &Model) -> Vec<NodeId> {
    let adj = model.adjacency();
    let mut outflow: AHashMap<NodeId, Vec<NodeId>> = AHashMap::new();
    for link in model.flow_links() {
        outflow.entry(link.from_node_id).or_default().push(link.to_node_id);
    }

    // reverse search from every exit
    let exits: Vec<NodeId> = model
        .nodes
        .values()
        .filter(|n| {
            let has_links = !adj.flow_in(n.node_id).is_empty() || !adj.flow_out(n.node_id).is_empty();
            has_links && (n.node_type.is_boundary() || adj.flow_out(n.node_id).is_empty())
        })
        .map(|n| n.node_id)
        .collect();
    let mut inflow: AHashMap<NodeId, Vec<NodeId>> = AHashMap::new();
    for (from, tos) in &outflow {
        for to in tos {
            inflow.entry(*to).or_default().push(*from);
        }
    }
    let mut drains: BTreeSet<NodeId> = exits.iter().copied().collect();
    let mut queue: VecDeque<NodeId> = exits.into_iter().collect();
    while let Some(current) = queue.pop_front() {
        for up in inflow.get(&current).map(|v| v.as_slice()).unwrap_or(&[]) {
            if drains.insert(*up) {
                queue.push_back(*up);
            }
        }
    }
    model
        .node_ids_of_type(NodeType::Basin)
        .into_iter()
        .filter(|id| !drains.contains(id))
        .collect()
}

fn check_internal_basins(model: &Model, defects: &mut Vec<Defect>) {
    for node_id in internal_basins(model) {
        defects.push(Defect::InternalBasin { node_id });
    }
}

fn check_basin_areas(model: &Model, defects: &mut Vec<Defect>) {
    for area in &model.basin_areas {
        if model.node_type(area.node_id) != Some(NodeType::Basin) {
            defects.push(Defect::UnassignedBasinArea { node_id: area.node_id });
        }
    }
    for (a, b, area) in overlapping_pairs(&model.basin_areas, OVERLAP_TOLERANCE) {
        defects.push(Defect::OverlappingBasinAreas { node_ids: (a, b), area });
    }
}

fn check_overlapping_nodes(model: &Model, defects: &mut Vec<Defect>) {
    let index = PointIndex::new(
        model
            .nodes
            .values()
            .filter(|n| !n.node_type.is_control())
            .map(|n| (n.node_id, n.geometry.0)),
    );
    for node in model.nodes.values().filter(|n| !n.node_type.is_control()) {
        for other in index.within(node.geometry.0, OVERLAPPING_NODE_DISTANCE) {
            if other <= node.node_id {
                continue;
            }
            let Some(c) = model.node_coord(other) else {
                continue;
            };
            defects.push(Defect::OverlappingNodes {
                node_ids: (node.node_id, other),
                distance: geometry::distance(node.geometry.0, c),
            });
        }
    }
}

fn check_basin_tables(model: &Model, defects: &mut Vec<Defect>) {
    for node_id in model.node_ids_of_type(NodeType::Basin) {
        let profile = model.tables.profile(node_id);
        if profile.is_empty() {
            defects.push(Defect::MissingProfile { node_id });
        } else if profile.len() < 2 {
            defects.push(Defect::InvalidProfile {
                node_id,
                reason: "fewer than 2 rows".to_string(),
            });
        } else if profile
            .windows(2)
            .any(|w| w[1].level <= w[0].level || w[1].area < w[0].area)
        {
            defects.push(Defect::InvalidProfile {
                node_id,
                reason: "levels must increase and areas must not decrease".to_string(),
            });
        } else if profile[0].area <= 0.0 {
            defects.push(Defect::InvalidProfile {
                node_id,
                reason: "bottom area must be positive".to_string(),
            });
        }

        let states: Vec<f64> = model
            .tables
            .basin_state
            .iter()
            .filter(|s| s.node_id == node_id)
            .map(|s| s.level)
            .collect();
        match states.as_slice() {
            [] => defects.push(Defect::MissingState { node_id }),
            [level, ..] => {
                let min = profile.iter().map(|r| r.level).fold(f64::INFINITY, f64::min);
                let max = profile.iter().map(|r| r.level).fold(f64::NEG_INFINITY, f64::max);
                if !profile.is_empty() && (*level < min || *level > max) {
                    defects.push(Defect::StateOutOfRange { node_id, level: *level });
                }
            }
        }
    }
}

fn check_static_tables(model: &Model, defects: &mut Vec<Defect>) {
    let mut owners: BTreeMap<NodeType, Option<BTreeSet<NodeId>>> = BTreeMap::new();
    for node in model.nodes.values() {
        let Some(set) = owners
            .entry(node.node_type)
            .or_insert_with(|| model.tables.static_owners(node.node_type))
        else {
            continue;
        };
        if !set.contains(&node.node_id) {
            defects.push(Defect::MissingStatic {
                node_id: node.node_id,
                node_type: node.node_type,
            });
        }
    }

    let mut curves: BTreeMap<NodeId, Vec<(Option<&str>, f64, f64)>> = BTreeMap::new();
    for row in &model.tables.tabulated_rating_curve_static {
        curves
            .entry(row.node_id)
            .or_default()
            .push((row.control_state.as_deref(), row.level, row.flow_rate));
    }
    for (node_id, rows) in curves {
        let invalid = rows
            .windows(2)
            .filter(|w| w[0].0 == w[1].0)
            .any(|w| w[1].1 <= w[0].1 || w[1].2 < w[0].2);
        if invalid {
            defects.push(Defect::InvalidRatingCurve { node_id });
        }
    }

    let mut seen: BTreeSet<(&str, NodeId)> = BTreeSet::new();
    for (table, node_id) in model.tables.row_owners() {
        if !seen.insert((table, node_id)) {
            continue;
        }
        let expected = table_owner_type(table);
        if model.node_type(node_id).is_none() || expected.is_some_and(|t| model.node_type(node_id) != Some(t)) {
            defects.push(Defect::OrphanTableRow {
                table: table.to_string(),
                node_id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tables::StructureStatic;
    use crate::model::test_support::*;

    fn fatal(model: &Model, scope: Scope) -> Vec<Defect> {
        validate(model, scope).into_iter().filter(Defect::is_fatal).collect()
    }

    #[test]
    fn test_two_basin_chain_is_clean() {
        let model = two_basin_chain();
        assert_eq!(fatal(&model, Scope::Full), vec![]);
        assert!(ensure_valid(&model, Scope::Full, Stage::Persist).is_ok());
    }

    #[test]
    fn test_dangling_connector() {
        let mut model = two_basin_chain();
        let pump = model.add_node(NodeType::Pump, pt(300.0, 0.0));
        model.add_link(3, pump, LinkType::Flow).unwrap();
        model.tables.pump_static.push(StructureStatic::new(pump, 1.0));
        let defects = fatal(&model, Scope::Topology);
        assert_eq!(
            defects,
            vec![Defect::InvalidConnectivity {
                node_id: pump,
                reason: "has no downstream node".into()
            }]
        );
    }

    #[test]
    fn test_duplicate_link() {
        let mut model = two_basin_chain();
        model.add_link(1, 2, LinkType::Flow).unwrap();
        let defects = fatal(&model, Scope::Topology);
        assert_eq!(
            defects,
            vec![Defect::DuplicateLink {
                link_ids: vec![1, 3],
                from_node_id: 1,
                to_node_id: 2
            }]
        );
    }

    #[test]
    fn test_type_matrix() {
        use NodeType::*;
        assert!(flow_link_allowed(Basin, Pump));
        assert!(flow_link_allowed(Outlet, LevelBoundary));
        assert!(flow_link_allowed(FlowBoundary, TabulatedRatingCurve));
        assert!(!flow_link_allowed(Basin, LevelBoundary));
        assert!(!flow_link_allowed(Pump, Outlet));
        assert!(!flow_link_allowed(ManningResistance, LevelBoundary));
        assert!(!flow_link_allowed(Basin, Basin));
        assert!(!flow_link_allowed(DiscreteControl, Pump));
        assert!(!flow_link_allowed(Terminal, Outlet));
    }

    #[test]
    fn test_internal_basin_cycle() {
        let mut model = two_basin_chain();
        let back = model.add_node(NodeType::Outlet, pt(100.0, 50.0));
        model.add_link(3, back, LinkType::Flow).unwrap();
        model.add_link(back, 1, LinkType::Flow).unwrap();
        model.tables.outlet_static.push(StructureStatic::new(back, 1.0));
        assert_eq!(internal_basins(&model), vec![1, 3]);

        let lonely = model.add_node(NodeType::Basin, pt(900.0, 900.0));
        assert_eq!(internal_basins(&model), vec![1, 3, lonely]);
    }

    #[test]
    fn test_full_scope_tables() {
        let mut model = two_basin_chain();
        model.tables.basin_state[0].level = 5.0;
        model.tables.pump_static.clear();
        model.tables.outlet_static.push(StructureStatic::new(2, 1.0));
        let defects = fatal(&model, Scope::Full);
        assert!(defects.contains(&Defect::StateOutOfRange { node_id: 1, level: 5.0 }));
        assert!(defects.contains(&Defect::MissingStatic {
            node_id: 2,
            node_type: NodeType::Pump
        }));
        assert!(defects.contains(&Defect::OrphanTableRow {
            table: "outlet_static".into(),
            node_id: 2
        }));
        assert!(fatal(&model, Scope::Topology).is_empty());
    }

    #[test]
    fn test_overlapping_nodes_are_not_fatal() {
        let mut model = two_basin_chain();
        model.move_node(2, pt(0.5, 0.0)).unwrap();
        let defects = validate(&model, Scope::Topology);
        assert!(defects.iter().any(|d| matches!(d, Defect::OverlappingNodes { .. })));
        assert!(defects.iter().all(|d| !d.is_fatal()));
    }
}
