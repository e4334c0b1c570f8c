use super::node::{Meta, NodeId};
use crate::geometry::line_length;
use geo_types::LineString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type LinkId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Flow,
    Control,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Flow => "flow",
            LinkType::Control => "control",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "flow" => Ok(LinkType::Flow),
            "control" => Ok(LinkType::Control),
            _ => Err(format!("Unknown link type '{}'. Valid options: flow, control", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub link_id: LinkId,
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
    pub link_type: LinkType,
    pub geometry: LineString<f64>,
    pub name: Option<String>,
    pub meta: Meta,
}

impl Link {
    /// Derived column, recomputed from the geometry on every write.
    pub fn length(&self) -> f64 {
        line_length(&self.geometry)
    }

    pub fn touches(&self, node_id: NodeId) -> bool {
        self.from_node_id == node_id || self.to_node_id == node_id
    }

    /// The node at the other end of the link, if `node_id` is one end.
    pub fn other_end(&self, node_id: NodeId) -> Option<NodeId> {
        if self.from_node_id == node_id {
            Some(self.to_node_id)
        } else if self.to_node_id == node_id {
            Some(self.from_node_id)
        } else {
            None
        }
    }
}
