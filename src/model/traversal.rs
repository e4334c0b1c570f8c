//! Breadth-first traversal over flow links.

use super::node::META_FUNCTION;
use super::{Adjacency, Model, NodeId, NodeType};
use std::collections::{BTreeSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Upstream,
    Downstream,
}

impl Model {
    /// Direct upstream neighbours over flow links, ascending.
    pub fn upstream_node_ids(&self, node_id: NodeId) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .flow_links()
            .filter(|l| l.to_node_id == node_id)
            .map(|l| l.from_node_id)
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Direct downstream neighbours over flow links, ascending.
    pub fn downstream_node_ids(&self, node_id: NodeId) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .flow_links()
            .filter(|l| l.from_node_id == node_id)
            .map(|l| l.to_node_id)
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// All nodes upstream of `node_id`. Traversal does not continue past
    /// LevelBoundary nodes nor, with `stop_at_inlet`, past inlet structures.
    pub fn upstream_nodes(&self, adj: &Adjacency, node_id: NodeId, stop_at_inlet: bool) -> BTreeSet<NodeId> {
        self.traverse(adj, node_id, Direction::Upstream, stop_at_inlet.then_some("inlet"))
    }

    /// All nodes downstream of `node_id`, mirroring `upstream_nodes`.
    pub fn downstream_nodes(&self, adj: &Adjacency, node_id: NodeId, stop_at_outlet: bool) -> BTreeSet<NodeId> {
        self.traverse(adj, node_id, Direction::Downstream, stop_at_outlet.then_some("outlet"))
    }

    pub fn upstream_basins(&self, adj: &Adjacency, node_id: NodeId, stop_at_inlet: bool) -> Vec<NodeId> {
        self.upstream_nodes(adj, node_id, stop_at_inlet)
            .into_iter()
            .filter(|id| *id != node_id && self.node_type(*id) == Some(NodeType::Basin))
            .collect()
    }

    pub fn downstream_basins(&self, adj: &Adjacency, node_id: NodeId, stop_at_outlet: bool) -> Vec<NodeId> {
        self.downstream_nodes(adj, node_id, stop_at_outlet)
            .into_iter()
            .filter(|id| *id != node_id && self.node_type(*id) == Some(NodeType::Basin))
            .collect()
    }

    fn traverse(
        &self,
        adj: &Adjacency,
        start: NodeId,
        direction: Direction,
        stop_function: Option<&str>,
    ) -> BTreeSet<NodeId> {
        let mut found = BTreeSet::from([start]);
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([start]);

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            let link_ids = match direction {
                Direction::Upstream => adj.flow_in(current),
                Direction::Downstream => adj.flow_out(current),
            };
            for link_id in link_ids {
                let Some(link) = self.links.get(link_id) else {
                    continue;
                };
                let next = match direction {
                    Direction::Upstream => link.from_node_id,
                    Direction::Downstream => link.to_node_id,
                };
                let Some(node) = self.nodes.get(&next) else {
                    continue;
                };
                found.insert(next);
                if node.node_type == NodeType::LevelBoundary {
                    continue;
                }
                if let Some(function) = stop_function {
                    if node.meta_str(META_FUNCTION) == Some(function) {
                        continue;
                    }
                }
                if !visited.contains(&next) {
                    queue.push_back(next);
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::super::node::META_FUNCTION;
    use super::super::test_support::*;
    use super::super::LinkType;
    use super::*;

    #[test]
    fn test_direct_neighbours() {
        let model = two_basin_chain();
        assert_eq!(model.upstream_node_ids(2), vec![1]);
        assert_eq!(model.downstream_node_ids(2), vec![3]);
        assert!(model.upstream_node_ids(1).is_empty());
    }

    #[test]
    fn test_upstream_basins_stop_at_inlet() {
        // 1 Basin -> 2 Pump -> 3 Basin -> 4 Outlet(inlet) -> 5 Basin
        let mut model = two_basin_chain();
        let outlet = model.add_node(NodeType::Outlet, pt(300.0, 0.0));
        let basin = model.add_node(NodeType::Basin, pt(400.0, 0.0));
        model.add_link(3, outlet, LinkType::Flow).unwrap();
        model.add_link(outlet, basin, LinkType::Flow).unwrap();
        model
            .node_mut(outlet)
            .unwrap()
            .meta
            .insert(META_FUNCTION.to_string(), "inlet".into());

        let adj = model.adjacency();
        assert_eq!(model.upstream_basins(&adj, basin, false), vec![1, 3]);
        assert!(model.upstream_basins(&adj, basin, true).is_empty());
        assert_eq!(model.downstream_basins(&adj, 1, false), vec![3, 5]);
    }

    #[test]
    fn test_traversal_stops_at_level_boundary() {
        let mut model = two_basin_chain();
        let lb = model.add_node(NodeType::LevelBoundary, pt(-100.0, 0.0));
        let outlet = model.add_node(NodeType::Outlet, pt(-50.0, 0.0));
        let far = model.add_node(NodeType::Basin, pt(-200.0, 0.0));
        model.add_link(far, lb, LinkType::Flow).unwrap();
        model.add_link(lb, outlet, LinkType::Flow).unwrap();
        model.add_link(outlet, 1, LinkType::Flow).unwrap();
        let adj = model.adjacency();
        let up = model.upstream_nodes(&adj, 3, false);
        assert!(up.contains(&lb));
        assert!(!up.contains(&far));
    }
}
