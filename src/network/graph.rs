//! Routing over a network: nearest lookups, splitting links at a point and
//! shortest paths by length.

use super::{Network, NetworkLink, NetworkLinkId, NetworkNode, NetworkNodeId, NodeClass};
use crate::geometry::{self, Coord, LineString};
use ahash::AHashMap;
use ordered_float::OrderedFloat;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Copy, Clone, Eq, PartialEq)]
struct State {
    cost: OrderedFloat<f64>,
    node: NetworkNodeId,
}

// Min-heap on cost; ties on node id keep `Ord` consistent with `PartialEq`.
impl Ord for State {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .cmp(&self.cost)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for State {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkPath {
    pub node_ids: Vec<NetworkNodeId>,
    pub link_ids: Vec<NetworkLinkId>,
    pub length: f64,
}

impl Network {
    pub fn next_node_id(&self) -> NetworkNodeId {
        self.nodes.keys().next_back().map(|id| id + 1).unwrap_or(1)
    }

    pub fn next_link_id(&self) -> NetworkLinkId {
        self.links.keys().next_back().map(|id| id + 1).unwrap_or(1)
    }

    /// Closest node; ties resolve to the lowest id.
    pub fn nearest_node(&self, point: Coord) -> Option<(NetworkNodeId, f64)> {
        let node_id = geometry::nearest(point, self.nodes.values().map(|n| (n.node_id, n.point)))?;
        Some((node_id, geometry::distance(point, self.nodes[&node_id].point)))
    }

    /// Links ordered by distance to `point`, then by id.
    pub fn links_by_distance(&self, point: Coord, limit: usize) -> Vec<(NetworkLinkId, f64)> {
        let mut out: Vec<(NetworkLinkId, f64)> = self
            .links
            .values()
            .map(|l| (l.link_id, geometry::point_line_distance(point, &l.geometry)))
            .collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        out.truncate(limit);
        out
    }

    /// Splits link `link_id` at arc length `s`, returning the new node.
    /// `None` if `s` is not strictly inside the link.
    pub fn split_link(&mut self, link_id: NetworkLinkId, s: f64) -> Option<NetworkNodeId> {
        let link = self.links.get(&link_id)?.clone();
        let length = link.length();
        if s <= 0.0 || s >= length {
            return None;
        }
        let point = geometry::interpolate(&link.geometry, s)?;
        let node_id = self.next_node_id();
        self.nodes.insert(
            node_id,
            NetworkNode {
                node_id,
                point,
                class: NodeClass::Connection,
            },
        );
        self.links.remove(&link_id);
        let first = geometry::substring(&link.geometry, 0.0, s);
        let second = geometry::substring(&link.geometry, s, length);
        self.links.insert(
            link_id,
            NetworkLink {
                to: node_id,
                geometry: first,
                ..link.clone()
            },
        );
        let second_id = self.next_link_id();
        self.links.insert(
            second_id,
            NetworkLink {
                link_id: second_id,
                from: node_id,
                geometry: second,
                ..link
            },
        );
        Some(node_id)
    }

    /// Node on link `link_id` for `point`: an end node when the projection
    /// lies within `align_distance` of it, an existing vertex within
    /// `max_snap_distance`, else a new node at the projection.
    pub fn snap_to_link(
        &mut self,
        link_id: NetworkLinkId,
        point: Coord,
        align_distance: f64,
        max_snap_distance: f64,
    ) -> Option<NetworkNodeId> {
        let link = self.links.get(&link_id)?;
        let projection = geometry::project_onto(&link.geometry, point)?;
        let from_point = self.nodes.get(&link.from)?.point;
        let to_point = self.nodes.get(&link.to)?.point;
        let d_from = geometry::distance(projection.point, from_point);
        let d_to = geometry::distance(projection.point, to_point);
        if d_from.min(d_to) <= align_distance {
            return Some(if d_from <= d_to { link.from } else { link.to });
        }

        // prefer an existing interior vertex close to the projection
        let mut walked = 0.0;
        let mut vertex_s: Option<(f64, f64)> = None;
        for w in link.geometry.0.windows(2) {
            walked += geometry::distance(w[0], w[1]);
            let d = geometry::distance(w[1], projection.point);
            if d <= max_snap_distance && vertex_s.is_none_or(|(_, best)| d < best) {
                vertex_s = Some((walked, d));
            }
        }
        let s = vertex_s.map(|(s, _)| s).unwrap_or(projection.s);
        self.split_link(link_id, s)
    }

    fn undirected_adjacency(&self) -> AHashMap<NetworkNodeId, Vec<(NetworkNodeId, NetworkLinkId, f64)>> {
        let mut adj: AHashMap<NetworkNodeId, Vec<(NetworkNodeId, NetworkLinkId, f64)>> = AHashMap::new();
        for link in self.links.values() {
            let length = link.length();
            adj.entry(link.from).or_default().push((link.to, link.link_id, length));
            adj.entry(link.to).or_default().push((link.from, link.link_id, length));
        }
        adj
    }

    /// Shortest path by length, ignoring link direction. `None` when the
    /// target is unreachable.
    pub fn shortest_path(&self, source: NetworkNodeId, target: NetworkNodeId) -> Option<NetworkPath> {
        if !self.nodes.contains_key(&source) || !self.nodes.contains_key(&target) {
            return None;
        }
        if source == target {
            return Some(NetworkPath {
                node_ids: vec![source],
                link_ids: vec![],
                length: 0.0,
            });
        }

        let adj = self.undirected_adjacency();
        let mut dist: AHashMap<NetworkNodeId, f64> = AHashMap::new();
        let mut prev: AHashMap<NetworkNodeId, (NetworkNodeId, NetworkLinkId)> = AHashMap::new();
        let mut heap = BinaryHeap::new();

        dist.insert(source, 0.0);
        heap.push(State {
            cost: OrderedFloat(0.0),
            node: source,
        });

        while let Some(State { cost, node: u }) = heap.pop() {
            if u == target {
                break;
            }
            // stale entry
            if cost.0 > *dist.get(&u).unwrap_or(&f64::INFINITY) {
                continue;
            }
            let Some(neighbours) = adj.get(&u) else {
                continue;
            };
            for &(v, link_id, length) in neighbours {
                let next = cost.0 + length;
                let better = match dist.get(&v) {
                    Some(&d) => next < d,
                    None => true,
                };
                if better {
                    dist.insert(v, next);
                    prev.insert(v, (u, link_id));
                    heap.push(State {
                        cost: OrderedFloat(next),
                        node: v,
                    });
                }
            }
        }

        let length = *dist.get(&target)?;
        let mut node_ids = vec![target];
        let mut link_ids = Vec::new();
        let mut current = target;
        while current != source {
            let (p, link_id) = *prev.get(&current)?;
            node_ids.push(p);
            link_ids.push(link_id);
            current = p;
        }
        node_ids.reverse();
        link_ids.reverse();
        Some(NetworkPath {
            node_ids,
            link_ids,
            length,
        })
    }

    /// Geometry of a path, each link oriented along the path.
    pub fn path_geometry(&self, path: &NetworkPath) -> LineString {
        let mut parts: Vec<LineString> = Vec::with_capacity(path.link_ids.len());
        for (i, link_id) in path.link_ids.iter().enumerate() {
            let Some(link) = self.links.get(link_id) else {
                continue;
            };
            if link.from == path.node_ids[i] {
                parts.push(link.geometry.clone());
            } else {
                parts.push(geometry::reversed(&link.geometry));
            }
        }
        if parts.is_empty() {
            let coords = path
                .node_ids
                .iter()
                .filter_map(|id| self.nodes.get(id).map(|n| n.point))
                .collect();
            return LineString::new(coords);
        }
        geometry::join_lines(parts.iter())
    }
}
