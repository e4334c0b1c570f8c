//! Per-node-type tables. Every row is owned by the node in its `node_id`
//! column; rows of a removed node are removed with it.

use super::node::{NodeId, NodeType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub trait NodeRow {
    fn node_id(&self) -> NodeId;
    fn node_id_mut(&mut self) -> &mut NodeId;
    /// Node this row observes, for control tables.
    fn listen_node_id_mut(&mut self) -> Option<&mut NodeId> {
        None
    }
}

macro_rules! impl_node_row {
    ($($row:ty),* $(,)?) => {
        $(impl NodeRow for $row {
            fn node_id(&self) -> NodeId {
                self.node_id
            }
            fn node_id_mut(&mut self) -> &mut NodeId {
                &mut self.node_id
            }
        })*
    };
}

macro_rules! impl_listening_row {
    ($($row:ty),* $(,)?) => {
        $(impl NodeRow for $row {
            fn node_id(&self) -> NodeId {
                self.node_id
            }
            fn node_id_mut(&mut self) -> &mut NodeId {
                &mut self.node_id
            }
            fn listen_node_id_mut(&mut self) -> Option<&mut NodeId> {
                Some(&mut self.listen_node_id)
            }
        })*
    };
}

// --- Basin ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasinProfile {
    pub node_id: NodeId,
    pub level: f64,
    pub area: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasinState {
    pub node_id: NodeId,
    pub level: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasinStatic {
    pub node_id: NodeId,
    pub precipitation: Option<f64>,
    pub potential_evaporation: Option<f64>,
    pub drainage: Option<f64>,
    pub infiltration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasinTime {
    pub node_id: NodeId,
    pub time: DateTime<Utc>,
    pub precipitation: Option<f64>,
    pub potential_evaporation: Option<f64>,
    pub drainage: Option<f64>,
    pub infiltration: Option<f64>,
}

// --- Connectors ---

/// Static row shared by Pump and Outlet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureStatic {
    pub node_id: NodeId,
    pub active: Option<bool>,
    pub control_state: Option<String>,
    pub flow_rate: f64,
    pub min_flow_rate: Option<f64>,
    pub max_flow_rate: Option<f64>,
    pub min_upstream_level: Option<f64>,
    pub max_downstream_level: Option<f64>,
}

impl StructureStatic {
    pub fn new(node_id: NodeId, flow_rate: f64) -> Self {
        Self {
            node_id,
            active: None,
            control_state: None,
            flow_rate,
            min_flow_rate: None,
            max_flow_rate: None,
            min_upstream_level: None,
            max_downstream_level: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManningResistanceStatic {
    pub node_id: NodeId,
    pub active: Option<bool>,
    pub control_state: Option<String>,
    pub length: f64,
    pub manning_n: f64,
    pub profile_width: f64,
    pub profile_slope: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearResistanceStatic {
    pub node_id: NodeId,
    pub active: Option<bool>,
    pub control_state: Option<String>,
    pub resistance: f64,
    pub max_flow_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabulatedRatingCurveStatic {
    pub node_id: NodeId,
    pub active: Option<bool>,
    pub control_state: Option<String>,
    pub level: f64,
    pub flow_rate: f64,
}

// --- Boundaries ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelBoundaryStatic {
    pub node_id: NodeId,
    pub active: Option<bool>,
    pub level: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowBoundaryStatic {
    pub node_id: NodeId,
    pub active: Option<bool>,
    pub flow_rate: f64,
}

// --- Control ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscreteControlVariable {
    pub node_id: NodeId,
    pub compound_variable_id: i32,
    pub listen_node_id: NodeId,
    pub variable: String,
    pub weight: Option<f64>,
    pub look_ahead: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscreteControlCondition {
    pub node_id: NodeId,
    pub compound_variable_id: i32,
    pub condition_id: i32,
    pub threshold_high: f64,
    pub threshold_low: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscreteControlLogic {
    pub node_id: NodeId,
    pub truth_state: String,
    pub control_state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousControlVariable {
    pub node_id: NodeId,
    pub listen_node_id: NodeId,
    pub variable: String,
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousControlFunction {
    pub node_id: NodeId,
    pub input: f64,
    pub output: f64,
    pub controlled_variable: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidControlStatic {
    pub node_id: NodeId,
    pub active: Option<bool>,
    pub control_state: Option<String>,
    pub listen_node_id: NodeId,
    pub target: f64,
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
}

impl_node_row!(
    BasinProfile,
    BasinState,
    BasinStatic,
    BasinTime,
    StructureStatic,
    ManningResistanceStatic,
    LinearResistanceStatic,
    TabulatedRatingCurveStatic,
    LevelBoundaryStatic,
    FlowBoundaryStatic,
    DiscreteControlCondition,
    DiscreteControlLogic,
    ContinuousControlFunction,
);

impl_listening_row!(DiscreteControlVariable, ContinuousControlVariable, PidControlStatic);

/// All tables of a model. Field names double as file stems in a bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tables {
    pub basin_profile: Vec<BasinProfile>,
    pub basin_state: Vec<BasinState>,
    pub basin_static: Vec<BasinStatic>,
    pub basin_time: Vec<BasinTime>,
    pub pump_static: Vec<StructureStatic>,
    pub outlet_static: Vec<StructureStatic>,
    pub manning_resistance_static: Vec<ManningResistanceStatic>,
    pub linear_resistance_static: Vec<LinearResistanceStatic>,
    pub tabulated_rating_curve_static: Vec<TabulatedRatingCurveStatic>,
    pub level_boundary_static: Vec<LevelBoundaryStatic>,
    pub flow_boundary_static: Vec<FlowBoundaryStatic>,
    pub discrete_control_variable: Vec<DiscreteControlVariable>,
    pub discrete_control_condition: Vec<DiscreteControlCondition>,
    pub discrete_control_logic: Vec<DiscreteControlLogic>,
    pub continuous_control_variable: Vec<ContinuousControlVariable>,
    pub continuous_control_function: Vec<ContinuousControlFunction>,
    pub pid_control_static: Vec<PidControlStatic>,
}

/// Runs `$body` once per table with `$t` bound to `&mut Vec<Row>`.
macro_rules! each_table_mut {
    ($tables:expr, |$t:ident| $body:block) => {{
        { let $t = &mut $tables.basin_profile; $body }
        { let $t = &mut $tables.basin_state; $body }
        { let $t = &mut $tables.basin_static; $body }
        { let $t = &mut $tables.basin_time; $body }
        { let $t = &mut $tables.pump_static; $body }
        { let $t = &mut $tables.outlet_static; $body }
        { let $t = &mut $tables.manning_resistance_static; $body }
        { let $t = &mut $tables.linear_resistance_static; $body }
        { let $t = &mut $tables.tabulated_rating_curve_static; $body }
        { let $t = &mut $tables.level_boundary_static; $body }
        { let $t = &mut $tables.flow_boundary_static; $body }
        { let $t = &mut $tables.discrete_control_variable; $body }
        { let $t = &mut $tables.discrete_control_condition; $body }
        { let $t = &mut $tables.discrete_control_logic; $body }
        { let $t = &mut $tables.continuous_control_variable; $body }
        { let $t = &mut $tables.continuous_control_function; $body }
        { let $t = &mut $tables.pid_control_static; $body }
    }};
}

impl Tables {
    /// Drops every row owned by `node_id`.
    pub fn remove_node(&mut self, node_id: NodeId) {
        each_table_mut!(self, |t| {
            t.retain(|row| row.node_id() != node_id);
        });
    }

    /// Keeps only rows whose owner satisfies `keep`.
    pub fn retain_nodes(&mut self, keep: impl Fn(NodeId) -> bool) {
        each_table_mut!(self, |t| {
            t.retain(|row| keep(row.node_id()));
        });
    }

    /// Rewrites `node_id` and `listen_node_id` columns through `map`.
    pub fn map_node_ids(&mut self, map: impl Fn(NodeId) -> NodeId) {
        each_table_mut!(self, |t| {
            for row in t.iter_mut() {
                let new_id = map(row.node_id());
                *row.node_id_mut() = new_id;
                if let Some(listen) = row.listen_node_id_mut() {
                    *listen = map(*listen);
                }
            }
        });
    }

    /// Replaces listen references to `from` by `to`.
    pub fn rewire_listen_node(&mut self, from: NodeId, to: NodeId) -> usize {
        let mut count = 0;
        each_table_mut!(self, |t| {
            for row in t.iter_mut() {
                if let Some(listen) = row.listen_node_id_mut() {
                    if *listen == from {
                        *listen = to;
                        count += 1;
                    }
                }
            }
        });
        count
    }

    /// Appends all rows of `other`, table by table.
    pub fn append(&mut self, other: Tables) {
        let Tables {
            basin_profile,
            basin_state,
            basin_static,
            basin_time,
            pump_static,
            outlet_static,
            manning_resistance_static,
            linear_resistance_static,
            tabulated_rating_curve_static,
            level_boundary_static,
            flow_boundary_static,
            discrete_control_variable,
            discrete_control_condition,
            discrete_control_logic,
            continuous_control_variable,
            continuous_control_function,
            pid_control_static,
        } = other;
        self.basin_profile.extend(basin_profile);
        self.basin_state.extend(basin_state);
        self.basin_static.extend(basin_static);
        self.basin_time.extend(basin_time);
        self.pump_static.extend(pump_static);
        self.outlet_static.extend(outlet_static);
        self.manning_resistance_static.extend(manning_resistance_static);
        self.linear_resistance_static.extend(linear_resistance_static);
        self.tabulated_rating_curve_static
            .extend(tabulated_rating_curve_static);
        self.level_boundary_static.extend(level_boundary_static);
        self.flow_boundary_static.extend(flow_boundary_static);
        self.discrete_control_variable.extend(discrete_control_variable);
        self.discrete_control_condition.extend(discrete_control_condition);
        self.discrete_control_logic.extend(discrete_control_logic);
        self.continuous_control_variable
            .extend(continuous_control_variable);
        self.continuous_control_function
            .extend(continuous_control_function);
        self.pid_control_static.extend(pid_control_static);
    }

    /// Stable sort of every table by owning node.
    pub fn sort(&mut self) {
        each_table_mut!(self, |t| {
            t.sort_by_key(|row| row.node_id());
        });
    }

    /// Pump or Outlet static table.
    pub fn structure_static(&self, node_type: NodeType) -> Option<&Vec<StructureStatic>> {
        match node_type {
            NodeType::Pump => Some(&self.pump_static),
            NodeType::Outlet => Some(&self.outlet_static),
            _ => None,
        }
    }

    pub fn structure_static_mut(&mut self, node_type: NodeType) -> Option<&mut Vec<StructureStatic>> {
        match node_type {
            NodeType::Pump => Some(&mut self.pump_static),
            NodeType::Outlet => Some(&mut self.outlet_static),
            _ => None,
        }
    }

    /// Nodes that own at least one row in the static table of `node_type`.
    /// `None` for node types without a required static table.
    pub fn static_owners(&self, node_type: NodeType) -> Option<BTreeSet<NodeId>> {
        fn owners<R: NodeRow>(rows: &[R]) -> BTreeSet<NodeId> {
            rows.iter().map(|r| r.node_id()).collect()
        }
        match node_type {
            NodeType::Pump => Some(owners(&self.pump_static)),
            NodeType::Outlet => Some(owners(&self.outlet_static)),
            NodeType::ManningResistance => Some(owners(&self.manning_resistance_static)),
            NodeType::LinearResistance => Some(owners(&self.linear_resistance_static)),
            NodeType::TabulatedRatingCurve => Some(owners(&self.tabulated_rating_curve_static)),
            NodeType::LevelBoundary => Some(owners(&self.level_boundary_static)),
            NodeType::FlowBoundary => Some(owners(&self.flow_boundary_static)),
            NodeType::DiscreteControl => Some(owners(&self.discrete_control_logic)),
            NodeType::PidControl => Some(owners(&self.pid_control_static)),
            NodeType::ContinuousControl => Some(owners(&self.continuous_control_function)),
            NodeType::Basin | NodeType::Terminal | NodeType::Junction => None,
        }
    }

    /// Owners of every row, for orphan detection: `(table, node_id)`.
    pub fn row_owners(&self) -> Vec<(&'static str, NodeId)> {
        let tables = self;
        let mut out = Vec::new();
        macro_rules! collect {
            ($($field:ident),*) => {
                $(out.extend(tables.$field.iter().map(|r| (stringify!($field), r.node_id())));)*
            };
        }
        collect!(
            basin_profile,
            basin_state,
            basin_static,
            basin_time,
            pump_static,
            outlet_static,
            manning_resistance_static,
            linear_resistance_static,
            tabulated_rating_curve_static,
            level_boundary_static,
            flow_boundary_static,
            discrete_control_variable,
            discrete_control_condition,
            discrete_control_logic,
            continuous_control_variable,
            continuous_control_function,
            pid_control_static
        );
        out
    }

    /// Drops the rows of `node_id` from the table named `table`.
    pub fn remove_rows(&mut self, table: &str, node_id: NodeId) -> usize {
        let tables = self;
        macro_rules! remove_from {
            ($($field:ident),*) => {
                match table {
                    $(stringify!($field) => {
                        let before = tables.$field.len();
                        tables.$field.retain(|r| r.node_id() != node_id);
                        before - tables.$field.len()
                    })*
                    _ => 0,
                }
            };
        }
        remove_from!(
            basin_profile,
            basin_state,
            basin_static,
            basin_time,
            pump_static,
            outlet_static,
            manning_resistance_static,
            linear_resistance_static,
            tabulated_rating_curve_static,
            level_boundary_static,
            flow_boundary_static,
            discrete_control_variable,
            discrete_control_condition,
            discrete_control_logic,
            continuous_control_variable,
            continuous_control_function,
            pid_control_static
        )
    }

    pub fn profile(&self, node_id: NodeId) -> Vec<&BasinProfile> {
        self.basin_profile
            .iter()
            .filter(|r| r.node_id == node_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> Tables {
        Tables {
            basin_profile: vec![
                BasinProfile { node_id: 2, level: 0.0, area: 1.0 },
                BasinProfile { node_id: 1, level: 0.0, area: 1.0 },
            ],
            pump_static: vec![StructureStatic::new(3, 1.0)],
            discrete_control_variable: vec![DiscreteControlVariable {
                node_id: 4,
                compound_variable_id: 1,
                listen_node_id: 1,
                variable: "level".into(),
                weight: Some(1.0),
                look_ahead: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_remove_node_cascades_rows() {
        let mut t = tables();
        t.remove_node(1);
        assert_eq!(t.basin_profile.len(), 1);
        assert_eq!(t.basin_profile[0].node_id, 2);
    }

    #[test]
    fn test_map_node_ids_rewrites_listen_columns() {
        let mut t = tables();
        t.map_node_ids(|id| id + 100);
        assert_eq!(t.discrete_control_variable[0].node_id, 104);
        assert_eq!(t.discrete_control_variable[0].listen_node_id, 101);
        assert_eq!(t.pump_static[0].node_id, 103);
    }

    #[test]
    fn test_static_owners() {
        let t = tables();
        assert_eq!(
            t.static_owners(NodeType::Pump).unwrap().into_iter().collect::<Vec<_>>(),
            vec![3]
        );
        assert!(t.static_owners(NodeType::Basin).is_none());
    }

    #[test]
    fn test_sort_and_rewire() {
        let mut t = tables();
        t.sort();
        assert_eq!(t.basin_profile[0].node_id, 1);
        assert_eq!(t.rewire_listen_node(1, 9), 1);
        assert_eq!(t.discrete_control_variable[0].listen_node_id, 9);
    }
}
