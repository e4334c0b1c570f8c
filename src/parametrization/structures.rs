//! Static tables of structures and boundaries. Values come from the
//! authority's sheets first, then from the category defaults, then from
//! measured profiles near the structure, then from neighbouring basins.

use super::ParametrizationConfig;
use super::conversions::{mm_per_day_to_m_per_second, round_flow_rate, round_to_precision};
use super::static_data::{CategoryDefaults, Function, StaticData};
use super::target_level::{ProfilePoint, downstream_target_level, upstream_target_level};
use crate::geometry;
use crate::model::edit::DEFAULT_CONNECTOR_FLOW_RATE;
use crate::model::node::{META_CATEGORIE, META_FUNCTION};
use crate::model::tables::{FlowBoundaryStatic, LevelBoundaryStatic, ManningResistanceStatic, StructureStatic};
use crate::model::{Adjacency, LinkType, MetaValue, Model, NodeId, NodeType};
use crate::report::{FindingKind, Report, Stage};
use std::collections::BTreeMap;
use tracing::debug;

fn fallback_category(node_type: NodeType, function: Option<Function>) -> &'static str {
    match (node_type, function) {
        (NodeType::Pump, Some(Function::Inlet)) => "Aanvoergemaal",
        (NodeType::Pump, _) => "Afvoergemaal",
        (_, Some(Function::Inlet)) => "Inlaat",
        _ => "Uitlaat",
    }
}

/// Flow capacity from the depth rate of the category over the basins the
/// structure serves: everything upstream for an outlet, downstream for an
/// inlet.
fn capacity_from_area(model: &Model, adj: &Adjacency, node_id: NodeId, defaults: &CategoryDefaults) -> Option<f64> {
    let mm_per_day = defaults.flow_rate_mm_per_day?;
    let basins = match defaults.function {
        Function::Outlet => model.upstream_basins(adj, node_id, true),
        Function::Inlet => model.downstream_basins(adj, node_id, true),
    };
    let area: f64 = basins.iter().map(|b| model.basin_area_m2(*b)).sum();
    (area > 0.0).then(|| round_flow_rate(mm_per_day_to_m_per_second(mm_per_day) * area))
}

/// Copies the sheet's `min_upstream_level` and `max_downstream_level` onto
/// the static rows of Pump and Outlet nodes, so basins without a target
/// level can take it from the structures draining them. Nodes without a
/// row get one at the default flow rate. Returns the number of nodes set.
pub fn apply_sheet_levels(model: &mut Model, static_data: &StaticData) -> usize {
    let mut count = 0;
    for node_type in [NodeType::Pump, NodeType::Outlet] {
        let sheet = static_data.structure_rows(node_type);
        let levels: Vec<(NodeId, Option<f64>, Option<f64>)> = model
            .nodes_of_type(node_type)
            .filter_map(|n| {
                let row = sheet.get(n.code()?)?;
                (row.min_upstream_level.is_some() || row.max_downstream_level.is_some())
                    .then_some((n.node_id, row.min_upstream_level, row.max_downstream_level))
            })
            .collect();
        let Some(table) = model.tables.structure_static_mut(node_type) else {
            continue;
        };
        for (node_id, min_upstream, max_downstream) in levels {
            if !table.iter().any(|r| r.node_id == node_id) {
                table.push(StructureStatic::new(node_id, DEFAULT_CONNECTOR_FLOW_RATE));
            }
            for row in table.iter_mut().filter(|r| r.node_id == node_id) {
                row.min_upstream_level = min_upstream.or(row.min_upstream_level);
                row.max_downstream_level = max_downstream.or(row.max_downstream_level);
            }
            count += 1;
        }
    }
    count
}

/// Mean of bottom and invert level over the profiles within `radius` of a
/// connector, on its upstream or downstream side. A profile is on the side
/// whose neighbouring node it lies closest to.
pub fn profile_level(
    model: &Model,
    node_id: NodeId,
    profiles: &[ProfilePoint],
    radius: f64,
    upstream: bool,
) -> Option<f64> {
    let at = model.node_coord(node_id)?;
    let up = model.upstream_node_ids(node_id).first().and_then(|id| model.node_coord(*id));
    let down = model.downstream_node_ids(node_id).first().and_then(|id| model.node_coord(*id));
    let (own, other) = if upstream { (up?, down) } else { (down?, up) };
    let levels: Vec<f64> = profiles
        .iter()
        .filter(|p| geometry::distance(p.geometry.0, at) <= radius)
        .filter(|p| other.is_none_or(|o| geometry::distance(p.geometry.0, own) < geometry::distance(p.geometry.0, o)))
        .filter_map(|p| Some((p.bottom_level? + p.invert_level?) / 2.0))
        .filter(|v| v.is_finite())
        .collect();
    if levels.is_empty() {
        return None;
    }
    Some(round_to_precision(levels.iter().sum::<f64>() / levels.len() as f64, 0.01))
}

/// Rebuilds the Pump or Outlet static table.
pub fn update_structure_static(
    model: &mut Model,
    node_type: NodeType,
    static_data: &StaticData,
    profiles: &[ProfilePoint],
    config: &ParametrizationConfig,
    report: &mut Report,
) {
    let sheet = static_data.structure_rows(node_type);
    let existing: BTreeMap<NodeId, f64> = model
        .tables
        .structure_static(node_type)
        .map(|rows| {
            let mut m = BTreeMap::new();
            for r in rows {
                let v = m.entry(r.node_id).or_insert(r.flow_rate);
                *v = f64::max(*v, r.flow_rate);
            }
            m
        })
        .unwrap_or_default();

    let adj = model.adjacency();
    let mut rows = Vec::new();
    let mut meta_updates = Vec::new();
    for node in model.nodes_of_type(node_type) {
        let node_id = node.node_id;
        let sheet_row = node.code().and_then(|c| sheet.get(c)).copied();
        let function = node.meta_str(META_FUNCTION).and_then(|f| f.parse().ok());
        let categorie = sheet_row
            .and_then(|r| r.categorie.clone())
            .or_else(|| node.meta_str(META_CATEGORIE).map(str::to_string))
            .unwrap_or_else(|| fallback_category(node_type, function).to_string());
        let defaults = static_data.category(&categorie);

        let mut row = StructureStatic::new(node_id, 0.0);
        let flow_rate = sheet_row
            .and_then(|r| r.flow_rate)
            .map(round_flow_rate)
            .or_else(|| defaults.and_then(|d| capacity_from_area(model, &adj, node_id, d)))
            .or_else(|| defaults.and_then(|d| d.flow_rate));
        row.flow_rate = match flow_rate {
            Some(q) => q,
            None => {
                let q = existing.get(&node_id).copied().unwrap_or(DEFAULT_CONNECTOR_FLOW_RATE);
                report.push(
                    Stage::Parametrization,
                    FindingKind::DefaultParameter,
                    vec![node_id],
                    format!("{node_type} flow_rate defaulted to {q}"),
                );
                q
            }
        };
        let radius = config.profile_search_distance;
        row.min_upstream_level = sheet_row
            .and_then(|r| r.min_upstream_level)
            .or_else(|| profile_level(model, node_id, profiles, radius, true))
            .or_else(|| {
                let offset = defaults.map_or(0.0, |d| d.upstream_level_offset);
                upstream_target_level(model, node_id).map(|l| round_to_precision(l - offset, 0.01))
            });
        row.max_downstream_level = sheet_row
            .and_then(|r| r.max_downstream_level)
            .or_else(|| profile_level(model, node_id, profiles, radius, false))
            .or_else(|| {
                let offset = defaults.map_or(0.0, |d| d.downstream_level_offset);
                downstream_target_level(model, node_id).map(|l| round_to_precision(l + offset, 0.01))
            });
        rows.push(row);

        let function = function.or(defaults.map(|d| d.function));
        meta_updates.push((node_id, categorie, function));
    }

    for (node_id, categorie, function) in meta_updates {
        if let Some(node) = model.node_mut(node_id) {
            node.meta
                .insert(META_CATEGORIE.to_string(), MetaValue::Text(categorie));
            if let Some(function) = function {
                node.meta
                    .insert(META_FUNCTION.to_string(), function.as_str().into());
            }
        }
    }
    if let Some(table) = model.tables.structure_static_mut(node_type) {
        *table = rows;
    }
    debug!(%node_type, "Parametrized structures");
}

pub fn update_manning_resistance_static(model: &mut Model, config: &ParametrizationConfig) {
    let rows = model
        .nodes_of_type(NodeType::ManningResistance)
        .map(|n| {
            let length: f64 = model
                .links
                .values()
                .filter(|l| l.link_type == LinkType::Flow && l.touches(n.node_id))
                .map(|l| l.length())
                .sum();
            ManningResistanceStatic {
                node_id: n.node_id,
                active: None,
                control_state: None,
                length: round_to_precision(length, 10.0).max(10.0),
                manning_n: config.manning_n,
                profile_width: config.profile_width,
                profile_slope: config.profile_slope,
            }
        })
        .collect();
    model.tables.manning_resistance_static = rows;
}

/// Level of a boundary from the basins on the other side of its
/// structure: upstream basins when water flows into the boundary,
/// downstream basins when it is a source.
fn neighbour_level(model: &Model, node_id: NodeId) -> Option<f64> {
    let upstream = model.upstream_node_ids(node_id);
    let (connectors, from_upstream) = if upstream.is_empty() {
        (model.downstream_node_ids(node_id), false)
    } else {
        (upstream, true)
    };
    connectors
        .into_iter()
        .filter_map(|c| {
            if from_upstream {
                upstream_target_level(model, c)
            } else {
                downstream_target_level(model, c)
            }
        })
        .reduce(f64::min)
}

pub fn update_level_boundary_static(model: &mut Model, static_data: &StaticData, report: &mut Report) {
    let sheet: BTreeMap<&str, f64> = static_data
        .level_boundary
        .iter()
        .filter_map(|r| Some((r.code.as_str(), r.level?)))
        .collect();
    let mut rows = Vec::new();
    for node in model.nodes_of_type(NodeType::LevelBoundary) {
        let level = node
            .code()
            .and_then(|c| sheet.get(c).copied())
            .or_else(|| neighbour_level(model, node.node_id));
        let level = match level {
            Some(l) => l,
            None => {
                report.push(
                    Stage::Parametrization,
                    FindingKind::DefaultParameter,
                    vec![node.node_id],
                    "level boundary without neighbouring target level, level set to 0",
                );
                0.0
            }
        };
        rows.push(LevelBoundaryStatic {
            node_id: node.node_id,
            active: None,
            level,
        });
    }
    model.tables.level_boundary_static = rows;
}

pub fn update_flow_boundary_static(model: &mut Model, static_data: &StaticData, config: &ParametrizationConfig) {
    let sheet: BTreeMap<&str, f64> = static_data
        .flow_boundary
        .iter()
        .filter_map(|r| Some((r.code.as_str(), r.flow_rate?)))
        .collect();
    model.tables.flow_boundary_static = model
        .nodes_of_type(NodeType::FlowBoundary)
        .map(|n| FlowBoundaryStatic {
            node_id: n.node_id,
            active: None,
            flow_rate: n
                .code()
                .and_then(|c| sheet.get(c).copied())
                .map(|q| round_to_precision(q, 0.01))
                .unwrap_or(config.boundary_flow_rate),
        })
        .collect();
}
