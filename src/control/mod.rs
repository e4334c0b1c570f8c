//! Control nodes for structures: discrete on/off control that holds the
//! target level of the basin a structure serves, and PID or continuous
//! control where the authority's sheets give a setpoint.

use crate::error::Result;
use crate::geometry::{self, Coord, MultiPolygon, Point};
use crate::model::node::{META_CODE, META_FUNCTION};
use crate::model::tables::{
    ContinuousControlFunction, ContinuousControlVariable, DiscreteControlCondition, DiscreteControlLogic,
    DiscreteControlVariable, PidControlStatic, StructureStatic,
};
use crate::model::{LinkType, Model, NodeId, NodeType};
use crate::parametrization::ParametrizationConfig;
use crate::parametrization::static_data::{Function, StaticData};
use crate::report::{FindingKind, Report, Stage};
use geo::Contains;
use itertools::Itertools;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const STATE_ON: &str = "on";
pub const STATE_OFF: &str = "off";

/// Truth states of a staircase over `conditions` thresholds: `F…F`,
/// `TF…F`, up to `T…T`.
pub fn truth_states(conditions: usize) -> Vec<String> {
    (0..=conditions)
        .map(|i| "T".repeat(i) + &"F".repeat(conditions - i))
        .collect()
}

/// Control states `<name>_1` .. `<name>_n`.
pub fn control_states(name: &str, n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("{name}_{i}")).collect()
}

fn basin_neighbour(model: &Model, node_id: NodeId, upstream: bool) -> Option<NodeId> {
    let neighbours = if upstream {
        model.upstream_node_ids(node_id)
    } else {
        model.downstream_node_ids(node_id)
    };
    neighbours
        .into_iter()
        .find(|id| model.node_type(*id) == Some(NodeType::Basin))
}

fn has_control_parent(model: &Model, node_id: NodeId) -> bool {
    model.control_links().any(|l| l.to_node_id == node_id)
}

/// Function of every Pump and Outlet without a control parent. With a
/// supply area a structure draining from inside to outside is an outlet
/// and one feeding from outside to inside is an inlet; otherwise the
/// `meta_function` of the node decides.
pub fn classify_structures(model: &Model, supply_area: Option<&MultiPolygon>) -> Vec<(NodeId, Function)> {
    let inside = |id: Option<NodeId>| {
        id.and_then(|id| model.node(id))
            .zip(supply_area)
            .is_some_and(|(n, area)| area.contains(&n.geometry))
    };
    let mut out = Vec::new();
    for node in model.nodes.values().filter(|n| n.node_type.is_controllable()) {
        if has_control_parent(model, node.node_id) {
            continue;
        }
        let function = match supply_area {
            Some(_) => {
                let from_inside = inside(model.upstream_node_ids(node.node_id).first().copied());
                let to_inside = inside(model.downstream_node_ids(node.node_id).first().copied());
                match (from_inside, to_inside) {
                    (true, false) => Some(Function::Outlet),
                    (false, true) => Some(Function::Inlet),
                    _ => None,
                }
            }
            None => node.meta_str(META_FUNCTION).and_then(|f| f.parse().ok()),
        };
        if let Some(function) = function {
            out.push((node.node_id, function));
        }
    }
    out
}

/// Adds a control node at a left-hand offset of `node_id` and links it.
fn add_control_node(model: &mut Model, node_type: NodeType, node_id: NodeId, offset: f64) -> Result<NodeId> {
    let at = model.require_node(node_id, Stage::Control)?.geometry.0;
    let from: Coord = model
        .upstream_node_ids(node_id)
        .first()
        .and_then(|id| model.node_coord(*id))
        .unwrap_or(at);
    let position = geometry::offset_left(from, at, offset);
    let control = model.add_node(node_type, Point(position));
    model.add_link(control, node_id, LinkType::Control)?;
    Ok(control)
}

/// Discrete control for one structure. An outlet listens to the basin
/// upstream and passes water while that basin is above target; an inlet
/// listens to the basin downstream and feeds it while it is below target.
/// Returns `None` when the listened basin has no target level.
pub fn add_discrete_control(
    model: &mut Model,
    node_id: NodeId,
    function: Function,
    config: &ParametrizationConfig,
    report: &mut Report,
) -> Result<Option<NodeId>> {
    let node_type = model.require_node(node_id, Stage::Control)?.node_type;
    let listen = basin_neighbour(model, node_id, function == Function::Outlet);
    let Some((listen_node_id, target)) = listen.and_then(|b| Some((b, model.target_level(b)?))) else {
        report.push(
            Stage::Control,
            FindingKind::MissingParameter,
            vec![node_id],
            "no target level in the controlled basin, structure left uncontrolled",
        );
        return Ok(None);
    };

    let capacity = model
        .tables
        .structure_static(node_type)
        .and_then(|rows| rows.iter().filter(|r| r.node_id == node_id).map(|r| r.flow_rate).reduce(f64::max))
        .unwrap_or(0.0);
    let template = model
        .tables
        .structure_static(node_type)
        .and_then(|rows| rows.iter().find(|r| r.node_id == node_id).cloned())
        .unwrap_or_else(|| StructureStatic::new(node_id, capacity));

    let control = add_control_node(model, NodeType::DiscreteControl, node_id, config.control_node_offset)?;
    if let Some(node) = model.node_mut(control) {
        let label = match function {
            Function::Outlet => "uitlaat",
            Function::Inlet => "inlaat",
        };
        node.name = Some(format!("{label}: {target:.2} [m+NAP]"));
    }

    let t = &mut model.tables;
    t.discrete_control_variable.push(DiscreteControlVariable {
        node_id: control,
        compound_variable_id: 1,
        listen_node_id,
        variable: "level".to_string(),
        weight: Some(1.0),
        look_ahead: None,
    });
    t.discrete_control_condition.push(DiscreteControlCondition {
        node_id: control,
        compound_variable_id: 1,
        condition_id: 1,
        threshold_high: target + config.control_threshold_margin,
        threshold_low: Some(target),
    });
    // Below target: outlets close and inlets open.
    let states = match function {
        Function::Outlet => [STATE_OFF, STATE_ON],
        Function::Inlet => [STATE_ON, STATE_OFF],
    };
    for (truth_state, control_state) in truth_states(1).into_iter().zip(states) {
        t.discrete_control_logic.push(DiscreteControlLogic {
            node_id: control,
            truth_state,
            control_state: control_state.to_string(),
        });
    }

    let rows: Vec<StructureStatic> = [STATE_OFF, STATE_ON]
        .into_iter()
        .map(|state| {
            let mut row = template.clone();
            row.control_state = Some(state.to_string());
            row.flow_rate = if state == STATE_ON { capacity } else { 0.0 };
            match function {
                Function::Outlet => row.min_upstream_level = Some(target),
                Function::Inlet => row.max_downstream_level = Some(target),
            }
            row
        })
        .collect();
    if let Some(table) = t.structure_static_mut(node_type) {
        table.retain(|r| r.node_id != node_id);
        table.extend(rows);
    }
    debug!(node_id, control, listen_node_id, target, "Added discrete control");
    Ok(Some(control))
}

fn nodes_by_code(model: &Model) -> BTreeMap<String, NodeId> {
    model
        .nodes
        .values()
        .filter(|n| n.node_type.is_controllable())
        .filter_map(|n| Some((n.meta_str(META_CODE)?.to_string(), n.node_id)))
        .collect()
}

fn listen_basin(model: &Model, node_id: NodeId) -> Option<NodeId> {
    let inlet = model
        .node(node_id)
        .and_then(|n| n.meta_str(META_FUNCTION))
        .is_some_and(|f| f == Function::Inlet.as_str());
    basin_neighbour(model, node_id, !inlet)
}

/// PID controllers for the structures listed in the `PidControl` sheet.
pub fn add_pid_controls(
    model: &mut Model,
    static_data: &StaticData,
    config: &ParametrizationConfig,
    report: &mut Report,
) -> Result<usize> {
    let codes = nodes_by_code(model);
    let mut added = 0;
    for row in &static_data.pid_control {
        let Some(&node_id) = codes.get(&row.code) else {
            report.push(
                Stage::Control,
                FindingKind::MissingParameter,
                vec![],
                format!("PID setpoint for unknown structure '{}'", row.code),
            );
            continue;
        };
        if has_control_parent(model, node_id) {
            continue;
        }
        let Some(listen_node_id) = listen_basin(model, node_id) else {
            report.push(Stage::Control, FindingKind::MissingParameter, vec![node_id], "no basin to listen to");
            continue;
        };
        let control = add_control_node(model, NodeType::PidControl, node_id, config.control_node_offset)?;
        model.tables.pid_control_static.push(PidControlStatic {
            node_id: control,
            active: None,
            control_state: None,
            listen_node_id,
            target: row.target,
            proportional: row.proportional.unwrap_or(config.pid_proportional),
            integral: row.integral.unwrap_or(config.pid_integral),
            derivative: row.derivative.unwrap_or(config.pid_derivative),
        });
        added += 1;
    }
    Ok(added)
}

/// Continuous controllers from the `ContinuousControl` sheet: the flow rate
/// of a structure as a function of the level of the basin it listens to.
pub fn add_continuous_controls(
    model: &mut Model,
    static_data: &StaticData,
    config: &ParametrizationConfig,
    report: &mut Report,
) -> Result<usize> {
    let codes = nodes_by_code(model);
    let mut added = 0;
    let rows = static_data
        .continuous_control
        .iter()
        .sorted_by(|a, b| a.code.cmp(&b.code).then(a.input.total_cmp(&b.input)));
    for (code, group) in &rows.chunk_by(|r| r.code.clone()) {
        let points: Vec<(f64, f64)> = group.map(|r| (r.input, r.output)).collect();
        let Some(&node_id) = codes.get(&code) else {
            report.push(
                Stage::Control,
                FindingKind::MissingParameter,
                vec![],
                format!("continuous control for unknown structure '{code}'"),
            );
            continue;
        };
        if has_control_parent(model, node_id) {
            continue;
        }
        let Some(listen_node_id) = listen_basin(model, node_id) else {
            report.push(Stage::Control, FindingKind::MissingParameter, vec![node_id], "no basin to listen to");
            continue;
        };
        let control = add_control_node(model, NodeType::ContinuousControl, node_id, config.control_node_offset)?;
        model.tables.continuous_control_variable.push(ContinuousControlVariable {
            node_id: control,
            listen_node_id,
            variable: "level".to_string(),
            weight: Some(1.0),
        });
        for (input, output) in points {
            model.tables.continuous_control_function.push(ContinuousControlFunction {
                node_id: control,
                input,
                output,
                controlled_variable: "flow_rate".to_string(),
            });
        }
        added += 1;
    }
    Ok(added)
}

/// Attaches controllers: first those the sheets ask for, then discrete
/// control on every remaining structure with a known function.
pub fn attach_control(
    model: &mut Model,
    static_data: &StaticData,
    supply_area: Option<&MultiPolygon>,
    config: &ParametrizationConfig,
    report: &mut Report,
) -> Result<usize> {
    let mut added = add_pid_controls(model, static_data, config, report)?;
    added += add_continuous_controls(model, static_data, config, report)?;
    for (node_id, function) in classify_structures(model, supply_area) {
        if add_discrete_control(model, node_id, function, config, report)?.is_some() {
            added += 1;
        }
    }
    info!(controllers = added, "Attached control");
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::*;
    use crate::parametrization::static_data::{ContinuousControlSheetRow, PidControlSheetRow};
    use crate::validation::{self, Scope};
    use geo_types::polygon;

    fn controlled_chain() -> Model {
        let mut model = two_basin_chain();
        model.set_target_level(1, 0.4);
        model.set_target_level(3, 0.1);
        model
            .node_mut(2)
            .unwrap()
            .meta
            .insert(META_CODE.to_string(), "KGM-1".into());
        model
    }

    #[test]
    fn test_truth_and_control_states() {
        assert_eq!(truth_states(1), vec!["F", "T"]);
        assert_eq!(truth_states(2), vec!["FF", "TF", "TT"]);
        assert_eq!(control_states("peil", 2), vec!["peil_1", "peil_2"]);
    }

    #[test]
    fn test_discrete_control_for_outlet() {
        let mut model = controlled_chain();
        let config = ParametrizationConfig::default();
        let control = add_discrete_control(&mut model, 2, Function::Outlet, &config, &mut Report::new())
            .unwrap()
            .unwrap();

        assert_eq!(model.node_type(control), Some(NodeType::DiscreteControl));
        // Upstream basin at (0,0), pump at (100,0): left of east is north.
        let c = model.node_coord(control).unwrap();
        assert_eq!((c.x, c.y), (100.0, config.control_node_offset));

        let cond = &model.tables.discrete_control_condition[0];
        assert_eq!(cond.threshold_low, Some(0.4));
        assert!((cond.threshold_high - 0.4 - config.control_threshold_margin).abs() < 1e-12);
        assert_eq!(model.tables.discrete_control_variable[0].listen_node_id, 1);
        let logic: Vec<(&str, &str)> = model
            .tables
            .discrete_control_logic
            .iter()
            .map(|l| (l.truth_state.as_str(), l.control_state.as_str()))
            .collect();
        assert_eq!(logic, vec![("F", "off"), ("T", "on")]);

        let rows: Vec<(Option<&str>, f64)> = model
            .tables
            .pump_static
            .iter()
            .map(|r| (r.control_state.as_deref(), r.flow_rate))
            .collect();
        assert_eq!(rows, vec![(Some("off"), 0.0), (Some("on"), 1.0)]);
        assert!(validation::ensure_valid(&model, Scope::Full, Stage::Control).is_ok());
    }

    #[test]
    fn test_inlet_mirrors_logic() {
        let mut model = controlled_chain();
        add_discrete_control(&mut model, 2, Function::Inlet, &ParametrizationConfig::default(), &mut Report::new())
            .unwrap();
        assert_eq!(model.tables.discrete_control_variable[0].listen_node_id, 3);
        assert_eq!(model.tables.discrete_control_logic[0].control_state, "on");
        assert_eq!(model.tables.pump_static[0].max_downstream_level, Some(0.1));
    }

    #[test]
    fn test_missing_target_is_reported() {
        let mut model = two_basin_chain();
        let mut report = Report::new();
        let added = add_discrete_control(&mut model, 2, Function::Outlet, &ParametrizationConfig::default(), &mut report)
            .unwrap();
        assert_eq!(added, None);
        assert_eq!(report.count(FindingKind::MissingParameter), 1);
        assert_eq!(model.nodes.len(), 3);
    }

    #[test]
    fn test_sheet_controllers_take_precedence() {
        let mut model = controlled_chain();
        model
            .node_mut(2)
            .unwrap()
            .meta
            .insert(META_FUNCTION.to_string(), "outlet".into());
        let data = StaticData {
            pid_control: vec![PidControlSheetRow {
                code: "KGM-1".to_string(),
                target: 0.35,
                proportional: None,
                integral: None,
                derivative: None,
            }],
            continuous_control: vec![ContinuousControlSheetRow {
                code: "KGM-1".to_string(),
                input: 0.0,
                output: 0.0,
            }],
            ..StaticData::default()
        };
        let config = ParametrizationConfig::default();
        let added = attach_control(&mut model, &data, None, &config, &mut Report::new()).unwrap();
        assert_eq!(added, 1);
        let pid = &model.tables.pid_control_static[0];
        assert_eq!((pid.listen_node_id, pid.target), (1, 0.35));
        assert_eq!(pid.proportional, -50000.0);
        assert!(model.tables.continuous_control_function.is_empty());
        assert!(model.tables.discrete_control_logic.is_empty());
    }

    #[test]
    fn test_continuous_control_function_table() {
        let mut model = controlled_chain();
        let data = StaticData {
            continuous_control: vec![
                ContinuousControlSheetRow { code: "KGM-1".to_string(), input: 0.5, output: 2.0 },
                ContinuousControlSheetRow { code: "KGM-1".to_string(), input: 0.0, output: 0.0 },
            ],
            ..StaticData::default()
        };
        let added = add_continuous_controls(&mut model, &data, &ParametrizationConfig::default(), &mut Report::new())
            .unwrap();
        assert_eq!(added, 1);
        let inputs: Vec<f64> = model.tables.continuous_control_function.iter().map(|r| r.input).collect();
        assert_eq!(inputs, vec![0.0, 0.5]);
        assert_eq!(model.tables.continuous_control_variable[0].listen_node_id, 1);
    }

    #[test]
    fn test_supply_area_classification() {
        let model = controlled_chain();
        let area = MultiPolygon::new(vec![polygon![
            (x: -50.0, y: -50.0), (x: 50.0, y: -50.0), (x: 50.0, y: 50.0), (x: -50.0, y: 50.0),
        ]]);
        assert_eq!(classify_structures(&model, Some(&area)), vec![(2, Function::Outlet)]);
        assert!(classify_structures(&model, None).is_empty());
    }
}
