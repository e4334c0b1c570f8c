//! Basin profile, state and forcing derived from basin areas.

use super::ParametrizationConfig;
use super::conversions::{mm_per_day_to_m_per_second, round_to_precision};
use crate::model::node::META_CATEGORIE;
use crate::model::tables::{BasinProfile, BasinState, BasinStatic, BasinTime};
use crate::model::{Model, NodeId, NodeType};
use crate::report::{FindingKind, Report, Stage};
use std::collections::BTreeMap;

/// Area of the profile bottom, kept above zero so volumes stay positive.
pub const BOTTOM_AREA: f64 = 0.1;

/// Share of the basin polygon that is open water, by category.
pub fn open_water_percentage(config: &ParametrizationConfig, categorie: Option<&str>) -> f64 {
    categorie
        .and_then(|c| config.open_water_percentages.get(c).copied())
        .unwrap_or(config.default_open_water_percentage)
}

/// Three-row profile per basin with an area and a target level: the bottom
/// `profile_depth` below target, one centimetre above it, and the open
/// water area at target. Basins lacking either keep their rows.
pub fn update_basin_profile(model: &mut Model, config: &ParametrizationConfig, report: &mut Report) {
    let mut profiles: BTreeMap<NodeId, Vec<BasinProfile>> = BTreeMap::new();
    for basin in model.nodes_of_type(NodeType::Basin) {
        let node_id = basin.node_id;
        let area = model.basin_area_m2(node_id);
        let Some(level) = model.target_level(node_id) else {
            continue;
        };
        if area <= 0.0 {
            continue;
        }
        let percentage = open_water_percentage(config, basin.meta_str(META_CATEGORIE));
        let open_water = round_to_precision((area * percentage / 100.0).max(BOTTOM_AREA), 0.1);
        let bottom = level - config.profile_depth;
        profiles.insert(
            node_id,
            vec![
                BasinProfile { node_id, level: bottom, area: BOTTOM_AREA },
                BasinProfile { node_id, level: bottom + 0.01, area: open_water },
                BasinProfile { node_id, level, area: open_water },
            ],
        );
    }
    let missing: Vec<NodeId> = model
        .node_ids_of_type(NodeType::Basin)
        .into_iter()
        .filter(|id| !profiles.contains_key(id) && model.tables.profile(*id).is_empty())
        .collect();
    for node_id in missing {
        report.push(
            Stage::Parametrization,
            FindingKind::MissingParameter,
            vec![node_id],
            "no area or target level to derive a profile from",
        );
    }
    model
        .tables
        .basin_profile
        .retain(|r| !profiles.contains_key(&r.node_id));
    model.tables.basin_profile.extend(profiles.into_values().flatten());
    model.tables.basin_profile.sort_by(|a, b| {
        a.node_id
            .cmp(&b.node_id)
            .then(a.level.total_cmp(&b.level))
            .then(a.area.total_cmp(&b.area))
    });
}

/// Initial level at the top of each profile.
pub fn update_basin_state(model: &mut Model) {
    let mut top: BTreeMap<NodeId, f64> = BTreeMap::new();
    for row in &model.tables.basin_profile {
        top.entry(row.node_id)
            .and_modify(|l| *l = l.max(row.level))
            .or_insert(row.level);
    }
    model.tables.basin_state = top
        .into_iter()
        .map(|(node_id, level)| BasinState { node_id, level })
        .collect();
}

/// Forcing per basin in m/s on the profile's largest area, scaled so the
/// volume matches the depth rate over the full polygon.
fn forcing_factors(model: &Model) -> BTreeMap<NodeId, f64> {
    let mut max_profile_area: BTreeMap<NodeId, f64> = BTreeMap::new();
    for row in &model.tables.basin_profile {
        let entry = max_profile_area.entry(row.node_id).or_insert(0.0);
        *entry = entry.max(row.area);
    }
    max_profile_area
        .into_iter()
        .filter(|(_, a)| *a > 0.0)
        .map(|(node_id, profile_area)| (node_id, model.basin_area_m2(node_id) / profile_area))
        .collect()
}

pub fn update_basin_static(model: &mut Model, config: &ParametrizationConfig) {
    let precipitation = mm_per_day_to_m_per_second(config.precipitation_mm_per_day);
    let evaporation = mm_per_day_to_m_per_second(config.evaporation_mm_per_day);
    model.tables.basin_static = forcing_factors(model)
        .into_iter()
        .map(|(node_id, factor)| BasinStatic {
            node_id,
            precipitation: Some(factor * precipitation),
            potential_evaporation: Some(factor * evaporation),
            drainage: Some(0.0),
            infiltration: Some(0.0),
        })
        .collect();
}

/// Synthetic three-step series over the run period: precipitation at the
/// start, evaporation at the middle and the end. Replaces the static
/// forcing.
pub fn add_basin_time_synthetic(model: &mut Model, config: &ParametrizationConfig) {
    let precipitation = mm_per_day_to_m_per_second(config.precipitation_mm_per_day);
    let evaporation = mm_per_day_to_m_per_second(config.evaporation_mm_per_day);
    let start = model.starttime;
    let end = model.endtime;
    let half = start + (end - start) / 2;

    let mut rows = Vec::new();
    for (node_id, factor) in forcing_factors(model) {
        for (time, p, e) in [
            (start, factor * precipitation, 0.0),
            (half, 0.0, factor * evaporation),
            (end, 0.0, factor * evaporation),
        ] {
            rows.push(BasinTime {
                node_id,
                time,
                precipitation: Some(p),
                potential_evaporation: Some(e),
                drainage: Some(0.0),
                infiltration: Some(0.0),
            });
        }
    }
    model.tables.basin_static.clear();
    model.tables.basin_time = rows;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BasinArea;
    use crate::model::test_support::*;
    use geo_types::{MultiPolygon, polygon};

    fn square(x0: f64, size: f64) -> MultiPolygon {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: -size / 2.0),
            (x: x0 + size, y: -size / 2.0),
            (x: x0 + size, y: size / 2.0),
            (x: x0, y: size / 2.0),
        ]])
    }

    fn model_with_areas() -> Model {
        let mut model = two_basin_chain();
        model.basin_areas.push(BasinArea::new(1, square(-50.0, 100.0)));
        model.basin_areas.push(BasinArea::new(3, square(150.0, 100.0)));
        model.set_target_level(1, 1.0);
        model.set_target_level(3, 0.5);
        model
            .node_mut(1)
            .unwrap()
            .meta
            .insert(META_CATEGORIE.to_string(), "hoofdwater".into());
        model
    }

    #[test]
    fn test_profile_and_state() {
        let mut model = model_with_areas();
        let config = ParametrizationConfig::default();
        update_basin_profile(&mut model, &config, &mut Report::new());
        update_basin_state(&mut model);

        let levels: Vec<(f64, f64)> = model.tables.profile(1).iter().map(|r| (r.level, r.area)).collect();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], (1.0 - config.profile_depth, BOTTOM_AREA));
        assert_eq!(levels[2], (1.0, 9000.0));
        assert_eq!(model.tables.profile(3)[2].area, 1000.0);
        assert_eq!(
            model.tables.basin_state,
            vec![BasinState { node_id: 1, level: 1.0 }, BasinState { node_id: 3, level: 0.5 }]
        );
    }

    #[test]
    fn test_forcing_scales_to_polygon() {
        let mut model = model_with_areas();
        let config = ParametrizationConfig {
            precipitation_mm_per_day: 86.4,
            ..ParametrizationConfig::default()
        };
        update_basin_profile(&mut model, &config, &mut Report::new());
        update_basin_static(&mut model, &config);
        // 10 % open water: the rate on the profile is ten times the depth rate
        let row = model.tables.basin_static.iter().find(|r| r.node_id == 3).unwrap();
        assert!((row.precipitation.unwrap() - 1e-5).abs() < 1e-12);

        add_basin_time_synthetic(&mut model, &config);
        assert!(model.tables.basin_static.is_empty());
        assert_eq!(model.tables.basin_time.len(), 6);
    }
}
