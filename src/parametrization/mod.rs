//! Fills the node-type tables of a topologically valid model from basin
//! areas, target levels, the authority's static-data sheets and defaults.

pub mod basin;
pub mod conversions;
pub mod static_data;
pub mod structures;
pub mod target_level;

use crate::model::node::{META_CODE, META_GESTUWD};
use crate::model::{Model, NodeType};
use crate::report::Report;
use serde::{Deserialize, Serialize};
use static_data::StaticData;
use std::collections::BTreeMap;
use target_level::ProfilePoint;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParametrizationConfig {
    pub precipitation_mm_per_day: f64,
    pub evaporation_mm_per_day: f64,
    /// Depth of the basin profile below target level, in metres.
    pub profile_depth: f64,
    /// Radius around a structure in which measured profiles set its levels.
    pub profile_search_distance: f64,
    /// Open water as a percentage of the basin polygon, by category.
    pub open_water_percentages: BTreeMap<String, f64>,
    pub default_open_water_percentage: f64,
    pub manning_n: f64,
    pub profile_width: f64,
    pub profile_slope: f64,
    pub boundary_flow_rate: f64,
    /// Replace static forcing by a three-step series over the run.
    pub synthetic_time: bool,
    pub control_node_offset: f64,
    /// Dead band above target level for discrete control.
    pub control_threshold_margin: f64,
    pub pid_proportional: f64,
    pub pid_integral: f64,
    pub pid_derivative: f64,
}

impl Default for ParametrizationConfig {
    fn default() -> Self {
        Self {
            precipitation_mm_per_day: 10.0,
            evaporation_mm_per_day: 0.0,
            profile_depth: 3.0,
            profile_search_distance: 50.0,
            open_water_percentages: [("hoofdwater", 90.0), ("doorgaand", 10.0), ("bergend", 3.0)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            default_open_water_percentage: 10.0,
            manning_n: 0.04,
            profile_width: 25.0,
            profile_slope: 1.0,
            boundary_flow_rate: 0.0,
            synthetic_time: false,
            control_node_offset: 10.0,
            control_threshold_margin: 0.01,
            pid_proportional: -50000.0,
            pid_integral: -1e-7,
            pid_derivative: 0.0,
        }
    }
}

/// Runs every parametrisation step in dependency order. Sheet levels of
/// structures go first as missing target levels are taken from them.
/// Target levels are needed by structures, structures by basins through
/// their capacity, and boundaries last as they read neighbouring levels.
pub fn parametrize(
    model: &mut Model,
    static_data: &StaticData,
    profiles: &[ProfilePoint],
    config: &ParametrizationConfig,
    report: &mut Report,
) {
    let gestuwd = target_level::propagate_gestuwd(model);
    structures::apply_sheet_levels(model, static_data);
    let filled = target_level::propagate_target_levels(model, profiles, report);
    for node_type in [NodeType::Pump, NodeType::Outlet] {
        structures::update_structure_static(model, node_type, static_data, profiles, config, report);
    }
    structures::update_manning_resistance_static(model, config);
    basin::update_basin_profile(model, config, report);
    basin::update_basin_state(model);
    if config.synthetic_time {
        basin::add_basin_time_synthetic(model, config);
    } else {
        basin::update_basin_static(model, config);
    }
    structures::update_level_boundary_static(model, static_data, report);
    structures::update_flow_boundary_static(model, static_data, config);
    info!(gestuwd, target_levels = filled, "Parametrized model");
}

/// Drops node meta not in `keep` and optionally names unnamed nodes after
/// their authority code.
pub fn sanitize_node_table(model: &mut Model, keep: &[&str], copy_code_to_name: bool) {
    for node in model.nodes.values_mut() {
        if copy_code_to_name && node.name.is_none() {
            node.name = node.meta_str(META_CODE).map(str::to_string);
        }
        node.meta.retain(|k, _| keep.contains(&k.as_str()));
    }
}

/// Meta columns kept by [`sanitize_node_table`] when none are named.
pub const DEFAULT_META_WHITELIST: &[&str] = &[
    META_CODE,
    META_GESTUWD,
    crate::model::node::META_AUTHORITY,
    crate::model::node::META_CATEGORIE,
    crate::model::node::META_FUNCTION,
    crate::model::node::META_STREEFPEIL,
    crate::model::node::META_NODE_ID_ORIGINAL,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BasinArea;
    use crate::model::test_support::*;
    use crate::parametrization::static_data::StructureSheetRow;
    use crate::report::Stage;
    use crate::validation::{self, Scope};
    use geo_types::{MultiPolygon, polygon};

    #[test]
    fn test_parametrize_chain_validates() {
        let mut model = two_basin_chain();
        let lb = model.add_node(NodeType::LevelBoundary, pt(300.0, 0.0));
        let o = model.add_node(NodeType::Outlet, pt(250.0, 0.0));
        model.add_link(3, o, crate::model::LinkType::Flow).unwrap();
        model.add_link(o, lb, crate::model::LinkType::Flow).unwrap();
        for (id, x0) in [(1, -100.0), (3, 150.0)] {
            model.basin_areas.push(BasinArea::new(
                id,
                MultiPolygon::new(vec![polygon![
                    (x: x0, y: -100.0), (x: x0 + 100.0, y: -100.0), (x: x0 + 100.0, y: 100.0), (x: x0, y: 100.0),
                ]]),
            ));
        }
        model.set_target_level(1, 1.0);
        model.set_target_level(3, 0.0);

        let mut report = Report::new();
        parametrize(
            &mut model,
            &StaticData::with_default_categories(),
            &[],
            &ParametrizationConfig::default(),
            &mut report,
        );
        assert_eq!(model.tables.outlet_static.len(), 1);
        assert_eq!(model.tables.level_boundary_static[0].level, 0.0);
        assert_eq!(model.tables.basin_state.len(), 2);
        assert_eq!(model.tables.basin_static.len(), 2);
        validation::ensure_valid(&model, Scope::Full, Stage::Parametrization).unwrap();
    }

    #[test]
    fn test_target_level_from_sheet_structure_level() {
        let mut model = two_basin_chain();
        model.node_mut(2).unwrap().meta.insert(META_CODE.to_string(), "KGM-1".into());
        model.set_target_level(3, -2.0);
        model.basin_areas.push(BasinArea::new(
            1,
            MultiPolygon::new(vec![polygon![
                (x: -100.0, y: -100.0), (x: 0.0, y: -100.0), (x: 0.0, y: 100.0), (x: -100.0, y: 100.0),
            ]]),
        ));
        let mut data = StaticData::with_default_categories();
        data.pump.push(StructureSheetRow {
            code: "KGM-1".to_string(),
            min_upstream_level: Some(-1.25),
            ..StructureSheetRow::default()
        });

        let mut report = Report::new();
        parametrize(&mut model, &data, &[], &ParametrizationConfig::default(), &mut report);
        assert_eq!(model.target_level(1), Some(-1.25));
        let pump = &model.tables.pump_static[0];
        assert_eq!(pump.min_upstream_level, Some(-1.25));
        assert_eq!(model.tables.basin_state.iter().find(|s| s.node_id == 1).map(|s| s.level), Some(-1.25));
        assert_eq!(report.count(crate::report::FindingKind::MissingParameter), 0);
    }

    #[test]
    fn test_sanitize_node_table() {
        let mut model = two_basin_chain();
        let node = model.node_mut(2).unwrap();
        node.meta.insert(META_CODE.to_string(), "KGM-1".into());
        node.meta.insert("meta_scratch".to_string(), 1.0.into());
        sanitize_node_table(&mut model, DEFAULT_META_WHITELIST, true);
        let node = model.node(2).unwrap();
        assert_eq!(node.name.as_deref(), Some("KGM-1"));
        assert!(!node.meta.contains_key("meta_scratch"));
        assert_eq!(node.code(), Some("KGM-1"));
    }
}
