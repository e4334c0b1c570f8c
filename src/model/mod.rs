//! In-memory model: id-keyed node and link tables, basin areas and the
//! per-node-type tables. Adjacency is derived on demand.

pub mod edit;
pub mod link;
pub mod node;
pub mod tables;
pub mod traversal;

pub use link::{Link, LinkId, LinkType};
pub use node::{Meta, MetaValue, Node, NodeId, NodeType};
pub use tables::Tables;

use crate::context::Crs;
use crate::error::{Error, Result};
use crate::geometry::{self, Coord, LineString, MultiPolygon, Point};
use crate::report::Stage;
use ahash::AHashMap;
use chrono::{DateTime, TimeZone, Utc};
use node::META_STREEFPEIL;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Polygon owned by a basin node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasinArea {
    pub node_id: NodeId,
    pub geometry: MultiPolygon<f64>,
    pub meta: Meta,
}

impl BasinArea {
    pub fn new(node_id: NodeId, geometry: MultiPolygon<f64>) -> Self {
        Self {
            node_id,
            geometry,
            meta: Meta::new(),
        }
    }

    pub fn streefpeil(&self) -> Option<f64> {
        self.meta.get(META_STREEFPEIL).and_then(|v| v.as_f64())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    pub algorithm: String,
    pub saveat: f64,
    pub abstol: f64,
    pub reltol: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            algorithm: "QNDF".to_string(),
            saveat: 86400.0,
            abstol: 1e-7,
            reltol: 1e-7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub crs: Crs,
    pub starttime: DateTime<Utc>,
    pub endtime: DateTime<Utc>,
    pub solver: SolverOptions,
    pub nodes: BTreeMap<NodeId, Node>,
    pub links: BTreeMap<LinkId, Link>,
    pub basin_areas: Vec<BasinArea>,
    pub tables: Tables,
}

/// Incident links per node, split by direction and link type.
#[derive(Debug, Default)]
pub struct Adjacency {
    pub flow_in: AHashMap<NodeId, Vec<LinkId>>,
    pub flow_out: AHashMap<NodeId, Vec<LinkId>>,
    pub control_in: AHashMap<NodeId, Vec<LinkId>>,
    pub control_out: AHashMap<NodeId, Vec<LinkId>>,
}

impl Adjacency {
    pub fn flow_in(&self, node_id: NodeId) -> &[LinkId] {
        self.flow_in.get(&node_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn flow_out(&self, node_id: NodeId) -> &[LinkId] {
        self.flow_out.get(&node_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn control_in(&self, node_id: NodeId) -> &[LinkId] {
        self.control_in.get(&node_id).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

impl Model {
    pub fn new(crs: Crs) -> Self {
        Self {
            crs,
            starttime: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            endtime: Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            solver: SolverOptions::default(),
            nodes: BTreeMap::new(),
            links: BTreeMap::new(),
            basin_areas: Vec::new(),
            tables: Tables::default(),
        }
    }

    // --- Nodes ---

    pub fn next_node_id(&self) -> NodeId {
        self.nodes.keys().next_back().map(|id| id + 1).unwrap_or(1)
    }

    pub fn next_link_id(&self) -> LinkId {
        self.links.keys().next_back().map(|id| id + 1).unwrap_or(1)
    }

    pub fn node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    pub fn node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    pub fn node_type(&self, node_id: NodeId) -> Option<NodeType> {
        self.nodes.get(&node_id).map(|n| n.node_type)
    }

    pub fn node_coord(&self, node_id: NodeId) -> Option<Coord> {
        self.nodes.get(&node_id).map(|n| n.geometry.0)
    }

    /// Node or a `Topology` error naming the missing id.
    pub fn require_node(&self, node_id: NodeId, stage: Stage) -> Result<&Node> {
        self.nodes
            .get(&node_id)
            .ok_or_else(|| Error::topology(stage, vec![node_id], "node exists"))
    }

    /// Adds a node with the next free id.
    pub fn add_node(&mut self, node_type: NodeType, geometry: Point) -> NodeId {
        let node_id = self.next_node_id();
        self.nodes
            .insert(node_id, Node::new(node_id, node_type, geometry));
        node_id
    }

    /// Inserts a fully built node; its id must be free.
    pub fn insert_node(&mut self, node: Node) -> Result<NodeId> {
        let node_id = node.node_id;
        if self.nodes.contains_key(&node_id) {
            return Err(Error::topology(Stage::Edit, vec![node_id], "node ids are unique"));
        }
        self.nodes.insert(node_id, node);
        Ok(node_id)
    }

    /// Removes a node with its incident links, table rows and basin areas.
    pub fn remove_node(&mut self, node_id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&node_id)?;
        self.links.retain(|_, l| !l.touches(node_id));
        self.tables.remove_node(node_id);
        self.basin_areas.retain(|a| a.node_id != node_id);
        Some(node)
    }

    pub fn nodes_of_type(&self, node_type: NodeType) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(move |n| n.node_type == node_type)
    }

    pub fn node_ids_of_type(&self, node_type: NodeType) -> Vec<NodeId> {
        self.nodes_of_type(node_type).map(|n| n.node_id).collect()
    }

    /// Moves a node and drags the ends of its links along.
    pub fn move_node(&mut self, node_id: NodeId, geometry: Point) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| Error::topology(Stage::Edit, vec![node_id], "node exists"))?;
        node.geometry = geometry;
        for link in self.links.values_mut() {
            if link.from_node_id == node_id || link.to_node_id == node_id {
                let (mut start, mut end) =
                    geometry::endpoints(&link.geometry).unwrap_or((geometry.0, geometry.0));
                if link.from_node_id == node_id {
                    start = geometry.0;
                }
                if link.to_node_id == node_id {
                    end = geometry.0;
                }
                link.geometry = geometry::snap_line_ends(&link.geometry, start, end);
            }
        }
        Ok(())
    }

    // --- Links ---

    pub fn link(&self, link_id: LinkId) -> Option<&Link> {
        self.links.get(&link_id)
    }

    /// Adds a straight link between two existing nodes.
    pub fn add_link(&mut self, from: NodeId, to: NodeId, link_type: LinkType) -> Result<LinkId> {
        self.add_link_with_geometry(from, to, link_type, None)
    }

    /// Adds a link; a given geometry has its ends snapped onto the nodes.
    pub fn add_link_with_geometry(
        &mut self,
        from: NodeId,
        to: NodeId,
        link_type: LinkType,
        geometry: Option<LineString>,
    ) -> Result<LinkId> {
        let a = self.require_node(from, Stage::Edit)?.geometry.0;
        let b = self.require_node(to, Stage::Edit)?.geometry.0;
        let geometry = match geometry {
            Some(line) => geometry::snap_line_ends(&line, a, b),
            None => geometry::straight_line(a, b),
        };
        let link_id = self.next_link_id();
        self.links.insert(
            link_id,
            Link {
                link_id,
                from_node_id: from,
                to_node_id: to,
                link_type,
                geometry,
                name: None,
                meta: Meta::new(),
            },
        );
        Ok(link_id)
    }

    pub fn remove_link(&mut self, link_id: LinkId) -> Option<Link> {
        self.links.remove(&link_id)
    }

    pub fn flow_links(&self) -> impl Iterator<Item = &Link> {
        self.links.values().filter(|l| l.link_type == LinkType::Flow)
    }

    pub fn control_links(&self) -> impl Iterator<Item = &Link> {
        self.links
            .values()
            .filter(|l| l.link_type == LinkType::Control)
    }

    pub fn adjacency(&self) -> Adjacency {
        let mut adj = Adjacency::default();
        for link in self.links.values() {
            let (ins, outs) = match link.link_type {
                LinkType::Flow => (&mut adj.flow_in, &mut adj.flow_out),
                LinkType::Control => (&mut adj.control_in, &mut adj.control_out),
            };
            ins.entry(link.to_node_id).or_default().push(link.link_id);
            outs.entry(link.from_node_id).or_default().push(link.link_id);
        }
        adj
    }

    // --- Basin areas ---

    pub fn basin_area(&self, node_id: NodeId) -> Option<&BasinArea> {
        self.basin_areas.iter().find(|a| a.node_id == node_id)
    }

    pub fn basin_area_mut(&mut self, node_id: NodeId) -> Option<&mut BasinArea> {
        self.basin_areas.iter_mut().find(|a| a.node_id == node_id)
    }

    /// Area of the basin polygon in m², zero without a polygon.
    pub fn basin_area_m2(&self, node_id: NodeId) -> f64 {
        self.basin_areas
            .iter()
            .filter(|a| a.node_id == node_id)
            .map(|a| geometry::polygon::area(&a.geometry))
            .sum()
    }

    /// Target level of a basin from its area, falling back to the node.
    pub fn target_level(&self, node_id: NodeId) -> Option<f64> {
        self.basin_area(node_id)
            .and_then(|a| a.streefpeil())
            .or_else(|| self.node(node_id).and_then(|n| n.meta_f64(META_STREEFPEIL)))
    }

    pub fn set_target_level(&mut self, node_id: NodeId, level: f64) {
        if let Some(area) = self.basin_area_mut(node_id) {
            area.meta
                .insert(META_STREEFPEIL.to_string(), MetaValue::Float(level));
        }
        if let Some(node) = self.node_mut(node_id) {
            node.meta
                .insert(META_STREEFPEIL.to_string(), MetaValue::Float(level));
        }
    }

    /// Distinct authority names stamped on nodes, sorted.
    pub fn authorities(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .nodes
            .values()
            .filter_map(|n| n.meta_str(node::META_AUTHORITY).map(str::to_string))
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Sorts table rows by node id so writes are reproducible.
    pub fn normalize(&mut self) {
        self.tables.sort();
        self.basin_areas.sort_by_key(|a| a.node_id);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_ids_start_at_one() {
        let mut model = Model::new(Crs::default());
        assert_eq!(model.next_node_id(), 1);
        assert_eq!(model.add_node(NodeType::Basin, pt(0.0, 0.0)), 1);
        assert_eq!(model.next_link_id(), 1);
    }

    #[test]
    fn test_remove_node_cascades() {
        let mut model = two_basin_chain();
        model.remove_node(2).unwrap();
        assert!(model.links.is_empty());
        assert!(model.tables.pump_static.is_empty());
        assert_eq!(model.nodes.len(), 2);
    }

    #[test]
    fn test_add_link_requires_nodes() {
        let mut model = two_basin_chain();
        assert!(matches!(
            model.add_link(1, 99, LinkType::Flow),
            Err(Error::Topology { .. })
        ));
    }

    #[test]
    fn test_move_node_drags_links() {
        let mut model = two_basin_chain();
        model.move_node(2, pt(100.0, 50.0)).unwrap();
        let link = model.link(1).unwrap();
        assert_eq!(link.geometry.0.last().copied(), Some(Coord { x: 100.0, y: 50.0 }));
        let link = model.link(2).unwrap();
        assert_eq!(link.geometry.0.first().copied(), Some(Coord { x: 100.0, y: 50.0 }));
    }

    #[test]
    fn test_adjacency() {
        let model = two_basin_chain();
        let adj = model.adjacency();
        assert_eq!(adj.flow_out(1), &[1]);
        assert_eq!(adj.flow_in(2), &[1]);
        assert_eq!(adj.flow_out(2), &[2]);
        assert!(adj.flow_out(3).is_empty());
    }

    #[test]
    fn test_target_level_prefers_area() {
        let mut model = two_basin_chain();
        model.basin_areas.push(BasinArea::new(1, geometry::polygon::empty()));
        model.set_target_level(1, 1.25);
        assert_eq!(model.target_level(1), Some(1.25));
        assert_eq!(model.basin_area(1).unwrap().streefpeil(), Some(1.25));
        assert_eq!(model.target_level(3), None);
    }
}
