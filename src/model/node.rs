use geo_types::Point;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type NodeId = i64;

/// Node types of the model, grouped into basins, connectors, boundaries and
/// control nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeType {
    Basin,
    Pump,
    Outlet,
    ManningResistance,
    LinearResistance,
    TabulatedRatingCurve,
    LevelBoundary,
    FlowBoundary,
    Terminal,
    Junction,
    DiscreteControl,
    ContinuousControl,
    PidControl,
}

impl NodeType {
    pub const ALL: &'static [NodeType] = &[
        NodeType::Basin,
        NodeType::Pump,
        NodeType::Outlet,
        NodeType::ManningResistance,
        NodeType::LinearResistance,
        NodeType::TabulatedRatingCurve,
        NodeType::LevelBoundary,
        NodeType::FlowBoundary,
        NodeType::Terminal,
        NodeType::Junction,
        NodeType::DiscreteControl,
        NodeType::ContinuousControl,
        NodeType::PidControl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Basin => "Basin",
            NodeType::Pump => "Pump",
            NodeType::Outlet => "Outlet",
            NodeType::ManningResistance => "ManningResistance",
            NodeType::LinearResistance => "LinearResistance",
            NodeType::TabulatedRatingCurve => "TabulatedRatingCurve",
            NodeType::LevelBoundary => "LevelBoundary",
            NodeType::FlowBoundary => "FlowBoundary",
            NodeType::Terminal => "Terminal",
            NodeType::Junction => "Junction",
            NodeType::DiscreteControl => "DiscreteControl",
            NodeType::ContinuousControl => "ContinuousControl",
            NodeType::PidControl => "PidControl",
        }
    }

    /// Moves water between two basins or a basin and a boundary.
    pub fn is_connector(&self) -> bool {
        matches!(
            self,
            NodeType::Pump
                | NodeType::Outlet
                | NodeType::ManningResistance
                | NodeType::LinearResistance
                | NodeType::TabulatedRatingCurve
        )
    }

    pub fn is_boundary(&self) -> bool {
        matches!(
            self,
            NodeType::LevelBoundary | NodeType::FlowBoundary | NodeType::Terminal
        )
    }

    pub fn is_control(&self) -> bool {
        matches!(
            self,
            NodeType::DiscreteControl | NodeType::ContinuousControl | NodeType::PidControl
        )
    }

    /// Connectors that may sit next to a boundary.
    pub fn may_touch_boundary(&self) -> bool {
        matches!(
            self,
            NodeType::Pump | NodeType::Outlet | NodeType::TabulatedRatingCurve
        )
    }

    /// Node types that a control node may steer.
    pub fn is_controllable(&self) -> bool {
        matches!(self, NodeType::Pump | NodeType::Outlet)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.replace(['_', ' '], "").to_lowercase();
        NodeType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().to_lowercase() == wanted)
            .ok_or_else(|| format!("Unknown node type '{}'", s))
    }
}

/// Value stored in the `meta_*` side map of nodes, links and basin areas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Float(v) => Some(*v),
            MetaValue::Integer(v) => Some(*v as f64),
            MetaValue::Text(s) => s.trim().parse().ok(),
            MetaValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(b) => Some(*b),
            MetaValue::Integer(v) => Some(*v != 0),
            MetaValue::Text(s) => match s.to_lowercase().as_str() {
                "true" | "1" | "ja" => Some(true),
                "false" | "0" | "nee" => Some(false),
                _ => None,
            },
            MetaValue::Float(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            MetaValue::Text(s) => serde_json::Value::String(s.clone()),
            MetaValue::Integer(v) => serde_json::Value::from(*v),
            MetaValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            MetaValue::Bool(b) => serde_json::Value::Bool(*b),
        }
    }

    /// `None` for JSON null, arrays and objects.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(MetaValue::Text(s.clone())),
            serde_json::Value::Bool(b) => Some(MetaValue::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) if !n.is_f64() => Some(MetaValue::Integer(i)),
                _ => n.as_f64().map(MetaValue::Float),
            },
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Text(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Text(s)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Float(v)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Integer(v)
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

/// Side map of `meta_*` attributes, ordered by key.
pub type Meta = BTreeMap<String, MetaValue>;

// well-known meta keys
pub const META_CODE: &str = "meta_code_waterbeheerder";
pub const META_AUTHORITY: &str = "meta_waterbeheerder";
pub const META_COUPLE_AUTHORITY: &str = "meta_couple_authority";
pub const META_STREEFPEIL: &str = "meta_streefpeil";
pub const META_CATEGORIE: &str = "meta_categorie";
pub const META_FUNCTION: &str = "meta_function";
pub const META_GESTUWD: &str = "meta_gestuwd";
pub const META_NODE_ID_ORIGINAL: &str = "meta_node_id_waterbeheerder";
pub const META_LINK_ID_ORIGINAL: &str = "meta_link_id_waterbeheerder";
pub const META_FROM_AUTHORITY: &str = "meta_from_authority";
pub const META_TO_AUTHORITY: &str = "meta_to_authority";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub geometry: Point<f64>,
    pub name: Option<String>,
    pub meta: Meta,
}

impl Node {
    pub fn new(node_id: NodeId, node_type: NodeType, geometry: Point<f64>) -> Self {
        Self {
            node_id,
            node_type,
            geometry,
            name: None,
            meta: Meta::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<MetaValue>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(|v| v.as_str())
    }

    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        self.meta.get(key).and_then(|v| v.as_f64())
    }

    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.meta.get(key).and_then(|v| v.as_bool())
    }

    /// Authority code of the structure, falling back to the name.
    pub fn code(&self) -> Option<&str> {
        self.meta_str(META_CODE).or(self.name.as_deref())
    }
}
