//! Automatic repairs, run after the edit script. Each pass validates the
//! model and fixes what it can; passes stop when nothing changes.

use super::{Defect, Scope, validate};
use crate::error::Result;
use crate::geometry::{self, Coord, Point, polygon};
use crate::model::node::META_FUNCTION;
use crate::model::tables::{BasinProfile, BasinState, TabulatedRatingCurveStatic};
use crate::model::{LinkId, LinkType, Meta, Model, NodeId, NodeType};
use crate::report::{FindingKind, Report, Stage};
use geo::Contains;
use itertools::Itertools;
use tracing::info;

/// Area of the bottom row of a made-up or repaired profile (m²).
pub const MIN_PROFILE_AREA: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct RepairConfig {
    pub max_passes: usize,
    /// Distance between a dangling connector and the boundary added for it (m)
    pub boundary_offset: f64,
    /// Retype every TabulatedRatingCurve to an Outlet
    pub sanitized: bool,
    /// Cap on the nearest-basin fallback for orphan areas (m)
    pub max_fallback_distance: f64,
    /// Depth of a profile made up for a basin without one (m)
    pub default_profile_depth: f64,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_passes: 5,
            boundary_offset: 10.0,
            sanitized: false,
            max_fallback_distance: 500.0,
            default_profile_depth: 2.0,
        }
    }
}

/// Repairs `model` in place and returns the fatal defects that remain.
pub fn repair(model: &mut Model, scope: Scope, config: &RepairConfig, report: &mut Report) -> Result<Vec<Defect>> {
    if config.sanitized {
        for node_id in model.node_ids_of_type(NodeType::TabulatedRatingCurve) {
            model.update_node(node_id, NodeType::Outlet)?;
            note(report, vec![node_id], "TabulatedRatingCurve replaced by Outlet".to_string());
        }
    }

    for pass in 1..=config.max_passes {
        let defects: Vec<Defect> = validate(model, scope).into_iter().filter(Defect::is_fatal).collect();
        if defects.is_empty() {
            return Ok(defects);
        }
        let mut fixed = 0usize;
        for defect in &defects {
            if fix(model, defect, config, report)? {
                fixed += 1;
            }
        }
        info!(pass, defects = defects.len(), fixed, "Repair pass");
        if fixed == 0 {
            return Ok(defects);
        }
    }
    Ok(validate(model, scope).into_iter().filter(Defect::is_fatal).collect())
}

fn note(report: &mut Report, node_ids: Vec<NodeId>, message: String) {
    report.push(Stage::Repair, FindingKind::AutomaticRepair, node_ids, message);
}

fn note_link(report: &mut Report, link_id: LinkId, message: String) {
    report.push_link(Stage::Repair, FindingKind::AutomaticRepair, vec![link_id], message);
}

fn midpoint(model: &Model, link_id: LinkId) -> Option<Point> {
    let link = model.link(link_id)?;
    geometry::interpolate(&link.geometry, link.length() / 2.0).map(Point)
}

/// Unit direction in which flow leaves `node_id`, continuing its links.
fn outward_direction(model: &Model, node_id: NodeId, downstream: bool) -> Coord {
    let here = model.node_coord(node_id).unwrap_or(Coord { x: 0.0, y: 0.0 });
    let neighbour = if downstream {
        model.upstream_node_ids(node_id).first().copied()
    } else {
        model.downstream_node_ids(node_id).first().copied()
    }
    .and_then(|id| model.node_coord(id));
    let (dx, dy) = match neighbour {
        Some(n) => (here.x - n.x, here.y - n.y),
        None if downstream => (1.0, 0.0),
        None => (-1.0, 0.0),
    };
    let len = dx.hypot(dy);
    if len == 0.0 {
        return Coord { x: 1.0, y: 0.0 };
    }
    Coord { x: dx / len, y: dy / len }
}

fn offset_point(model: &Model, node_id: NodeId, downstream: bool, distance: f64) -> Point {
    let here = model.node_coord(node_id).unwrap_or(Coord { x: 0.0, y: 0.0 });
    let dir = outward_direction(model, node_id, downstream);
    Point::new(here.x + dir.x * distance, here.y + dir.y * distance)
}

/// Adds a LevelBoundary next to `connector` on its missing side.
fn add_boundary(model: &mut Model, connector: NodeId, downstream: bool, config: &RepairConfig) -> Result<NodeId> {
    let point = offset_point(model, connector, downstream, config.boundary_offset);
    let level = if downstream {
        model.upstream_node_ids(connector)
    } else {
        model.downstream_node_ids(connector)
    }
    .into_iter()
    .filter_map(|id| model.target_level(id))
    .reduce(f64::min);
    let boundary = model.add_node(NodeType::LevelBoundary, point);
    model.add_default_rows(boundary, NodeType::LevelBoundary, None);
    if let Some(level) = level {
        for row in model.tables.level_boundary_static.iter_mut().filter(|r| r.node_id == boundary) {
            row.level = level;
        }
    }
    if downstream {
        model.add_link(connector, boundary, LinkType::Flow)?;
    } else {
        model.add_link(boundary, connector, LinkType::Flow)?;
    }
    Ok(boundary)
}

/// Replaces link `link_id` by `from -> new node -> to`.
fn insert_on_link(model: &mut Model, link_id: LinkId, node_type: NodeType) -> Result<Option<NodeId>> {
    let Some(point) = midpoint(model, link_id) else {
        return Ok(None);
    };
    let Some(link) = model.remove_link(link_id) else {
        return Ok(None);
    };
    let node_id = model.add_node(node_type, point);
    model.add_link(link.from_node_id, node_id, LinkType::Flow)?;
    model.add_link(node_id, link.to_node_id, LinkType::Flow)?;
    model.add_default_rows(node_id, node_type, None);
    Ok(Some(node_id))
}

fn fix(model: &mut Model, defect: &Defect, config: &RepairConfig, report: &mut Report) -> Result<bool> {
    match defect {
        Defect::DuplicateLink { link_ids, .. } => {
            let mut removed = false;
            for link_id in link_ids.iter().skip(1) {
                if model.remove_link(*link_id).is_some() {
                    note_link(report, *link_id, format!("removed duplicate link {link_id}"));
                    removed = true;
                }
            }
            Ok(removed)
        }
        Defect::MissingNode { link_id, .. } | Defect::SelfLoop { link_id, .. } | Defect::InvalidControlLink { link_id } => {
            let removed = model.remove_link(*link_id).is_some();
            if removed {
                note_link(report, *link_id, format!("removed link {link_id}: {defect}"));
            }
            Ok(removed)
        }
        Defect::LinkEndpointMismatch { link_id, .. } => {
            let Some(link) = model.link(*link_id) else {
                return Ok(false);
            };
            let (from, to) = (link.from_node_id, link.to_node_id);
            model.redirect_link(*link_id, Some(from), Some(to))?;
            note_link(report, *link_id, format!("snapped ends of link {link_id}"));
            Ok(true)
        }
        Defect::InvalidConnectivity { node_id, .. } => fix_connectivity(model, *node_id, config, report),
        Defect::IncorrectTypeConnectivity { link_id, .. } => fix_type_connectivity(model, *link_id, report),
        Defect::InternalBasin { node_id } => {
            // an earlier fix in this pass may already drain it
            if !super::internal_basins(model).contains(node_id) {
                return Ok(false);
            }
            let outlet_point = offset_point(model, *node_id, true, config.boundary_offset);
            let outlet = model.add_node(NodeType::Outlet, outlet_point);
            if let Some(node) = model.node_mut(outlet) {
                node.meta.insert(META_FUNCTION.to_string(), "outlet".into());
            }
            model.add_link(*node_id, outlet, LinkType::Flow)?;
            model.add_default_rows(outlet, NodeType::Outlet, None);
            let boundary = add_boundary(model, outlet, true, config)?;
            note(
                report,
                vec![*node_id, outlet, boundary],
                format!("internal basin {node_id} drained through Outlet {outlet} to LevelBoundary {boundary}"),
            );
            Ok(true)
        }
        Defect::UnassignedBasinArea { node_id } => fix_orphan_area(model, *node_id, config, report),
        Defect::OverlappingBasinAreas { node_ids: (a, b), .. } => {
            let Some(keep) = model.basin_area(*a).map(|x| x.geometry.clone()) else {
                return Ok(false);
            };
            let Some(area) = model.basin_area_mut(*b) else {
                return Ok(false);
            };
            area.geometry = polygon::difference(&area.geometry, &keep);
            if polygon::is_empty(&area.geometry) {
                model.basin_areas.retain(|x| x.node_id != *b);
            }
            note(report, vec![*a, *b], format!("removed overlap of basin {b} with basin {a}"));
            Ok(true)
        }
        Defect::MissingProfile { node_id } => {
            let top = model.target_level(*node_id).unwrap_or(0.0);
            let area = model.basin_area_m2(*node_id).max(1.0);
            model.tables.basin_profile.push(BasinProfile {
                node_id: *node_id,
                level: top - config.default_profile_depth,
                area: MIN_PROFILE_AREA,
            });
            model.tables.basin_profile.push(BasinProfile {
                node_id: *node_id,
                level: top,
                area,
            });
            note(report, vec![*node_id], format!("default profile for basin {node_id}"));
            Ok(true)
        }
        Defect::InvalidProfile { node_id, .. } => {
            // a basin never runs completely dry
            let rows = monotonic_profile(
                model
                    .tables
                    .profile(*node_id)
                    .into_iter()
                    .map(|r| (r.level, r.area.max(MIN_PROFILE_AREA))),
            );
            model.tables.remove_rows("basin_profile", *node_id);
            model.tables.basin_profile.extend(rows.into_iter().map(|(level, area)| BasinProfile {
                node_id: *node_id,
                level,
                area,
            }));
            note(report, vec![*node_id], format!("made profile of basin {node_id} monotonic"));
            Ok(true)
        }
        Defect::MissingState { node_id } => {
            let level = model
                .tables
                .profile(*node_id)
                .iter()
                .map(|r| r.level)
                .reduce(f64::max)
                .unwrap_or(0.0);
            model.tables.basin_state.push(BasinState { node_id: *node_id, level });
            note(report, vec![*node_id], format!("state of basin {node_id} set to {level}"));
            Ok(true)
        }
        Defect::StateOutOfRange { node_id, .. } => {
            let levels: Vec<f64> = model.tables.profile(*node_id).iter().map(|r| r.level).collect();
            let (Some(min), Some(max)) = (
                levels.iter().copied().reduce(f64::min),
                levels.iter().copied().reduce(f64::max),
            ) else {
                return Ok(false);
            };
            for state in model.tables.basin_state.iter_mut().filter(|s| s.node_id == *node_id) {
                state.level = state.level.clamp(min, max);
            }
            note(report, vec![*node_id], format!("clamped state of basin {node_id}"));
            Ok(true)
        }
        Defect::MissingStatic { node_id, node_type } => {
            if node_type.is_control() {
                return Ok(false);
            }
            model.add_default_rows(*node_id, *node_type, None);
            report.push(
                Stage::Repair,
                FindingKind::DefaultParameter,
                vec![*node_id],
                format!("default static row for {node_type} {node_id}"),
            );
            Ok(true)
        }
        Defect::InvalidRatingCurve { node_id } => {
            let mut rows: Vec<TabulatedRatingCurveStatic> = model
                .tables
                .tabulated_rating_curve_static
                .iter()
                .filter(|r| r.node_id == *node_id)
                .cloned()
                .collect();
            rows.sort_by(|a, b| a.control_state.cmp(&b.control_state));
            model.tables.remove_rows("tabulated_rating_curve_static", *node_id);
            for (state, group) in &rows.into_iter().chunk_by(|r| r.control_state.clone()) {
                let group: Vec<TabulatedRatingCurveStatic> = group.collect();
                let active = group.first().and_then(|r| r.active);
                let fixed = monotonic_profile(group.iter().map(|r| (r.level, r.flow_rate)));
                model
                    .tables
                    .tabulated_rating_curve_static
                    .extend(fixed.into_iter().map(|(level, flow_rate)| TabulatedRatingCurveStatic {
                        node_id: *node_id,
                        active,
                        control_state: state.clone(),
                        level,
                        flow_rate,
                    }));
            }
            note(report, vec![*node_id], format!("made rating curve of {node_id} monotonic"));
            Ok(true)
        }
        Defect::OrphanTableRow { table, node_id } => {
            let removed = model.tables.remove_rows(table, *node_id);
            if removed > 0 {
                note(report, vec![*node_id], format!("dropped {removed} orphan row(s) from {table}"));
            }
            Ok(removed > 0)
        }
        Defect::OverlappingNodes { .. } => Ok(false),
    }
}

/// Sorts by level, keeps the largest value per level and makes the second
/// column non-decreasing. A single row is extended one metre upwards.
pub fn monotonic_profile(rows: impl IntoIterator<Item = (f64, f64)>) -> Vec<(f64, f64)> {
    let mut rows: Vec<(f64, f64)> = rows.into_iter().collect();
    rows.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
    let mut out: Vec<(f64, f64)> = Vec::with_capacity(rows.len());
    for (level, value) in rows {
        match out.last_mut() {
            Some(last) if last.0 == level => last.1 = last.1.max(value),
            Some(last) => {
                let value = value.max(last.1);
                out.push((level, value));
            }
            None => out.push((level, value)),
        }
    }
    if out.len() == 1 {
        let (level, value) = out[0];
        out.push((level + 1.0, value));
    }
    out
}

fn fix_connectivity(model: &mut Model, node_id: NodeId, config: &RepairConfig, report: &mut Report) -> Result<bool> {
    let Some(node_type) = model.node_type(node_id) else {
        return Ok(false);
    };
    let upstream = model.upstream_node_ids(node_id);
    let downstream = model.downstream_node_ids(node_id);
    match (upstream.as_slice(), downstream.as_slice()) {
        ([], []) => {
            model.remove_node(node_id);
            note(report, vec![node_id], format!("removed unconnected {node_type} {node_id}"));
            Ok(true)
        }
        ([up], [down]) if up == down => {
            model.remove_node(node_id);
            note(
                report,
                vec![node_id, *up],
                format!("removed {node_type} {node_id} that connected basin {up} to itself"),
            );
            Ok(true)
        }
        (_, []) | ([], _) => {
            let downstream_missing = downstream.is_empty();
            if !node_type.may_touch_boundary() {
                model.update_node(node_id, NodeType::Outlet)?;
            }
            let boundary = add_boundary(model, node_id, downstream_missing, config)?;
            note(
                report,
                vec![node_id, boundary],
                format!(
                    "dangling {node_type} {node_id} connected to new LevelBoundary {boundary} on its {} side",
                    if downstream_missing { "downstream" } else { "upstream" }
                ),
            );
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn fix_type_connectivity(model: &mut Model, link_id: LinkId, report: &mut Report) -> Result<bool> {
    let Some(link) = model.link(link_id) else {
        return Ok(false);
    };
    let (from, to) = (link.from_node_id, link.to_node_id);
    let (Some(from_type), Some(to_type)) = (model.node_type(from), model.node_type(to)) else {
        return Ok(false);
    };
    let basin_or_boundary = |t: NodeType| t == NodeType::Basin || t.is_boundary();

    if from_type.is_connector() && to_type.is_connector() {
        let basin = insert_on_link(model, link_id, NodeType::Basin)?;
        note_link(
            report,
            link_id,
            format!("inserted Basin {basin:?} between {from_type} {from} and {to_type} {to}"),
        );
        return Ok(basin.is_some());
    }
    if basin_or_boundary(from_type) && basin_or_boundary(to_type) {
        let outlet = insert_on_link(model, link_id, NodeType::Outlet)?;
        note_link(
            report,
            link_id,
            format!("inserted Outlet {outlet:?} between {from_type} {from} and {to_type} {to}"),
        );
        return Ok(outlet.is_some());
    }
    let connector = if from_type.is_boundary() {
        Some((to, to_type))
    } else if to_type.is_boundary() {
        Some((from, from_type))
    } else {
        None
    };
    if let Some((connector, connector_type)) = connector.filter(|(_, t)| t.is_connector()) {
        model.update_node(connector, NodeType::Outlet)?;
        note(
            report,
            vec![connector],
            format!("{connector_type} {connector} next to a boundary replaced by Outlet"),
        );
        return Ok(true);
    }
    model.remove_link(link_id);
    note_link(
        report,
        link_id,
        format!("removed link {link_id} from {from_type} {from} to {to_type} {to}"),
    );
    Ok(true)
}

fn fix_orphan_area(model: &mut Model, node_id: NodeId, config: &RepairConfig, report: &mut Report) -> Result<bool> {
    let orphans: Vec<_> = model
        .basin_areas
        .iter()
        .filter(|a| a.node_id == node_id)
        .cloned()
        .collect();
    if orphans.is_empty() {
        return Ok(false);
    }
    model.basin_areas.retain(|a| a.node_id != node_id);
    for orphan in orphans {
        let inside = model
            .nodes_of_type(NodeType::Basin)
            .find(|n| orphan.geometry.contains(&n.geometry))
            .map(|n| n.node_id);
        let target = inside.or_else(|| {
            let c = polygon::centroid(&orphan.geometry)?;
            let basin = geometry::nearest(c, model.nodes_of_type(NodeType::Basin).map(|n| (n.node_id, n.geometry.0)))?;
            let d = geometry::distance(c, model.node_coord(basin)?);
            (d <= config.max_fallback_distance).then_some(basin)
        });
        match target {
            Some(basin) => {
                let others: Vec<_> = model
                    .basin_areas
                    .iter()
                    .filter(|a| a.node_id != basin)
                    .map(|a| a.geometry.clone())
                    .collect();
                let free = polygon::difference(&orphan.geometry, &polygon::union_all(others.iter()));
                if !polygon::is_empty(&free) {
                    model.add_basin_area(basin, free, Meta::new())?;
                }
                note(report, vec![basin], format!("area of missing basin {node_id} given to basin {basin}"));
            }
            None => {
                report.push(
                    Stage::Repair,
                    FindingKind::UnassignedBasinArea,
                    vec![node_id],
                    format!("area of missing basin {node_id} dropped"),
                );
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BasinArea;
    use crate::model::tables::StructureStatic;
    use crate::model::test_support::*;
    use geo_types::polygon;

    fn fatal(model: &Model) -> Vec<Defect> {
        validate(model, Scope::Full).into_iter().filter(Defect::is_fatal).collect()
    }

    #[test]
    fn test_dangling_connector_gets_level_boundary() {
        let mut model = two_basin_chain();
        let pump = model.add_node(NodeType::Pump, pt(300.0, 0.0));
        model.add_link(3, pump, LinkType::Flow).unwrap();
        model.tables.pump_static.push(StructureStatic::new(pump, 1.0));
        let mut report = Report::new();
        let remaining = repair(&mut model, Scope::Full, &RepairConfig::default(), &mut report).unwrap();
        assert!(remaining.is_empty(), "{remaining:?}");
        let lb = model.nodes_of_type(NodeType::LevelBoundary).next().unwrap();
        assert_eq!(lb.geometry, pt(310.0, 0.0));
        assert_eq!(model.upstream_node_ids(lb.node_id), vec![pump]);
        assert!(report.count(FindingKind::AutomaticRepair) >= 1);
        assert!(fatal(&model).is_empty());
    }

    #[test]
    fn test_duplicate_link_removed() {
        let mut model = two_basin_chain();
        model.add_link(1, 2, LinkType::Flow).unwrap();
        let mut report = Report::new();
        let remaining = repair(&mut model, Scope::Full, &RepairConfig::default(), &mut report).unwrap();
        assert!(remaining.is_empty());
        assert_eq!(model.links.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_manning_next_to_boundary_becomes_outlet() {
        let mut model = two_basin_chain();
        let manning = model.add_node(NodeType::ManningResistance, pt(300.0, 0.0));
        let lb = model.add_node(NodeType::LevelBoundary, pt(400.0, 0.0));
        model.add_link(3, manning, LinkType::Flow).unwrap();
        model.add_link(manning, lb, LinkType::Flow).unwrap();
        model.add_default_rows(manning, NodeType::ManningResistance, None);
        model.add_default_rows(lb, NodeType::LevelBoundary, None);
        let mut report = Report::new();
        let remaining = repair(&mut model, Scope::Full, &RepairConfig::default(), &mut report).unwrap();
        assert!(remaining.is_empty(), "{remaining:?}");
        assert_eq!(model.node_type(manning), Some(NodeType::Outlet));
        assert!(model.tables.manning_resistance_static.is_empty());
    }

    #[test]
    fn test_connector_pair_gets_basin() {
        let mut model = two_basin_chain();
        let outlet = model.add_node(NodeType::Outlet, pt(200.0, 100.0));
        model.add_link(2, outlet, LinkType::Flow).unwrap();
        model.add_link(outlet, 3, LinkType::Flow).unwrap();
        model.tables.outlet_static.push(StructureStatic::new(outlet, 1.0));
        let mut report = Report::new();
        let remaining = repair(&mut model, Scope::Full, &RepairConfig::default(), &mut report).unwrap();
        assert!(remaining.is_empty(), "{remaining:?}");
        assert_eq!(model.nodes_of_type(NodeType::Basin).count(), 3);
    }

    #[test]
    fn test_sanitized_model_has_no_rating_curves() {
        let mut model = two_basin_chain();
        model.update_node(2, NodeType::TabulatedRatingCurve).unwrap();
        let config = RepairConfig {
            sanitized: true,
            ..RepairConfig::default()
        };
        let mut report = Report::new();
        repair(&mut model, Scope::Full, &config, &mut report).unwrap();
        assert_eq!(model.node_type(2), Some(NodeType::Outlet));
        assert_eq!(model.tables.outlet_static[0].flow_rate, 1.0);
        assert!(model.tables.tabulated_rating_curve_static.is_empty());
    }

    #[test]
    fn test_orphan_area_goes_to_containing_basin() {
        let mut model = two_basin_chain();
        model.basin_areas.push(BasinArea::new(
            99,
            geo_types::MultiPolygon::new(vec![polygon![
                (x: -10.0, y: -10.0), (x: 10.0, y: -10.0), (x: 10.0, y: 10.0), (x: -10.0, y: 10.0), (x: -10.0, y: -10.0)
            ]]),
        ));
        let mut report = Report::new();
        let remaining = repair(&mut model, Scope::Full, &RepairConfig::default(), &mut report).unwrap();
        assert!(remaining.is_empty());
        assert!((model.basin_area_m2(1) - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_monotonic_profile() {
        assert_eq!(
            monotonic_profile(vec![(1.0, 10.0), (0.0, 20.0), (1.0, 5.0)]),
            vec![(0.0, 20.0), (1.0, 20.0)]
        );
        assert_eq!(monotonic_profile(vec![(0.0, 3.0)]), vec![(0.0, 3.0), (1.0, 3.0)]);
    }

    #[test]
    fn test_second_pass_is_clean() {
        let mut model = two_basin_chain();
        let pump = model.add_node(NodeType::Pump, pt(300.0, 0.0));
        model.add_link(3, pump, LinkType::Flow).unwrap();
        model.add_link(3, pump, LinkType::Flow).unwrap();
        let mut report = Report::new();
        repair(&mut model, Scope::Full, &RepairConfig::default(), &mut report).unwrap();
        let again = repair(&mut model, Scope::Full, &RepairConfig::default(), &mut report).unwrap();
        assert!(again.is_empty());
    }
}
