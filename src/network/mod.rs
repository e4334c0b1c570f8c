//! Builds a directed node-link network from water-course linestrings by
//! clustering line endpoints and splitting lines at every cluster they pass.

pub mod graph;
pub mod model_builder;

use crate::error::{Error, Result};
use crate::geometry::index::PointIndex;
use crate::geometry::{self, Coord, Geometry, LineString};
use crate::report::{FindingKind, Report, Stage};
use ahash::AHashMap;
use geo::BoundingRect;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub type NetworkNodeId = i64;
pub type NetworkLinkId = i64;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Endpoints closer than this are one node (m)
    pub tolerance: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { tolerance: 0.01 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeClass {
    /// Only outgoing links
    UpstreamBoundary,
    /// Only incoming links
    DownstreamBoundary,
    Connection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkNode {
    pub node_id: NetworkNodeId,
    pub point: Coord,
    pub class: NodeClass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkLink {
    pub link_id: NetworkLinkId,
    pub from: NetworkNodeId,
    pub to: NetworkNodeId,
    pub geometry: LineString,
    pub code: Option<String>,
    pub name: Option<String>,
}

impl NetworkLink {
    pub fn length(&self) -> f64 {
        geometry::line_length(&self.geometry)
    }
}

/// Input water course.
#[derive(Debug, Clone)]
pub struct InputLine {
    pub geometry: Geometry,
    pub code: Option<String>,
    pub name: Option<String>,
}

impl InputLine {
    pub fn new(geometry: impl Into<Geometry>) -> Self {
        Self {
            geometry: geometry.into(),
            code: None,
            name: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub nodes: BTreeMap<NetworkNodeId, NetworkNode>,
    pub links: BTreeMap<NetworkLinkId, NetworkLink>,
}

struct PreparedLine {
    geometry: LineString,
    code: Option<String>,
    name: Option<String>,
}

// --- Endpoint clustering ---

/// Single-link clusters of endpoints: any two points within `tolerance` end
/// up in one cluster. Clusters are returned in order of their first member.
fn cluster_endpoints(points: &[Coord], tolerance: f64) -> Vec<Vec<usize>> {
    let index = PointIndex::new(points.iter().copied().enumerate());
    let mut assigned = vec![false; points.len()];
    let mut clusters = Vec::new();

    for start in 0..points.len() {
        if assigned[start] {
            continue;
        }
        assigned[start] = true;
        let mut members = vec![start];
        let mut cursor = 0;
        while cursor < members.len() {
            let current = members[cursor];
            cursor += 1;
            for neighbour in index.within(points[current], tolerance) {
                if !assigned[neighbour] {
                    assigned[neighbour] = true;
                    members.push(neighbour);
                }
            }
        }
        members.sort();
        clusters.push(members);
    }
    clusters
}

fn mean(points: &[Coord], members: &[usize]) -> Coord {
    let n = members.len().max(1) as f64;
    let (sx, sy) = members
        .iter()
        .fold((0.0, 0.0), |(sx, sy), &i| (sx + points[i].x, sy + points[i].y));
    Coord { x: sx / n, y: sy / n }
}

/// Merges clusters whose centres ended up within `tolerance` of each other.
fn merge_close_clusters(points: &[Coord], mut clusters: Vec<Vec<usize>>, tolerance: f64) -> Vec<Vec<usize>> {
    loop {
        let centres: Vec<Coord> = clusters.iter().map(|m| mean(points, m)).collect();
        let groups = cluster_endpoints(&centres, tolerance);
        if groups.len() == clusters.len() {
            return clusters;
        }
        let mut merged: Vec<Vec<usize>> = groups
            .into_iter()
            .map(|group| {
                let mut members: Vec<usize> = group.iter().flat_map(|&g| clusters[g].clone()).collect();
                members.sort();
                members
            })
            .collect();
        merged.sort_by_key(|m| m[0]);
        clusters = merged;
    }
}

impl Network {
    /// Builds the network. Lines that are invalid after repair, or that touch
    /// only one node, are skipped and reported.
    pub fn from_lines(lines: Vec<InputLine>, config: &NetworkConfig, report: &mut Report) -> Result<Network> {
        let tolerance = config.tolerance;

        // explode, repair, split closed loops
        let mut prepared: Vec<PreparedLine> = Vec::new();
        for (idx, line) in lines.into_iter().enumerate() {
            let parts = geometry::explode_lines(&line.geometry);
            if parts.is_empty() {
                report.push(
                    Stage::Network,
                    FindingKind::InvalidGeometry,
                    vec![],
                    format!("line {} ({:?}) is not a linestring", idx, line.code),
                );
            }
            for part in parts {
                let Some(repaired) = geometry::repair_linestring(&part) else {
                    report.push(
                        Stage::Network,
                        FindingKind::InvalidGeometry,
                        vec![],
                        format!("line {} ({:?}) has fewer than two valid vertices", idx, line.code),
                    );
                    continue;
                };
                let length = geometry::line_length(&repaired);
                // both ends would fall in one cluster
                if length <= tolerance {
                    report.push(
                        Stage::Network,
                        FindingKind::DiscardedLine,
                        vec![],
                        format!("line {} ({:?}) is shorter than the tolerance and is discarded", idx, line.code),
                    );
                    continue;
                }
                let closed = geometry::endpoints(&repaired)
                    .map(|(a, b)| geometry::distance(a, b) <= tolerance)
                    .unwrap_or(false);
                if closed {
                    debug!(idx, "Splitting closed loop at its midpoint");
                    for half in [
                        geometry::substring(&repaired, 0.0, length / 2.0),
                        geometry::substring(&repaired, length / 2.0, length),
                    ] {
                        prepared.push(PreparedLine {
                            geometry: half,
                            code: line.code.clone(),
                            name: line.name.clone(),
                        });
                    }
                } else {
                    prepared.push(PreparedLine {
                        geometry: repaired,
                        code: line.code.clone(),
                        name: line.name.clone(),
                    });
                }
            }
        }

        // endpoints: 2*i is the start of line i, 2*i+1 its end
        let endpoints: Vec<Coord> = prepared
            .iter()
            .flat_map(|l| {
                let (a, b) = geometry::endpoints(&l.geometry).unwrap_or_default();
                [a, b]
            })
            .collect();
        let clusters = merge_close_clusters(&endpoints, cluster_endpoints(&endpoints, tolerance), tolerance);

        let mut endpoint_node: Vec<NetworkNodeId> = vec![0; endpoints.len()];
        let mut node_points: BTreeMap<NetworkNodeId, Coord> = BTreeMap::new();
        for (i, members) in clusters.iter().enumerate() {
            let node_id = i as NetworkNodeId + 1;
            node_points.insert(node_id, mean(&endpoints, members));
            for &m in members {
                endpoint_node[m] = node_id;
            }
        }
        let node_index = PointIndex::new(node_points.iter().map(|(id, c)| (*id, *c)));

        let mut network = Network::default();
        let mut next_link_id: NetworkLinkId = 1;
        for (line_idx, line) in prepared.iter().enumerate() {
            let length = geometry::line_length(&line.geometry);
            let mut stops: Vec<(f64, NetworkNodeId)> = vec![
                (0.0, endpoint_node[2 * line_idx]),
                (length, endpoint_node[2 * line_idx + 1]),
            ];
            if let Some(rect) = line.geometry.bounding_rect() {
                for node_id in node_index.in_rect(rect, tolerance) {
                    let Some(proj) = geometry::project_onto(&line.geometry, node_points[&node_id]) else {
                        continue;
                    };
                    if proj.distance <= tolerance {
                        stops.push((proj.s, node_id));
                    }
                }
            }
            stops.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            // a node is visited once per line, at its first stop
            let mut seen = Vec::new();
            stops.retain(|(_, id)| {
                if seen.contains(id) {
                    false
                } else {
                    seen.push(*id);
                    true
                }
            });

            if stops.len() < 2 {
                report.push(
                    Stage::Network,
                    FindingKind::DiscardedLine,
                    stops.iter().map(|(_, id)| *id).collect(),
                    format!("line {:?} touches a single node and is discarded", line.code),
                );
                continue;
            }

            for pair in stops.windows(2) {
                let (s0, from) = pair[0];
                let (s1, to) = pair[1];
                let a = node_points[&from];
                let b = node_points[&to];
                let piece = geometry::substring(&line.geometry, s0, s1);
                let piece = if piece.0.len() >= 2 && s1 > s0 {
                    geometry::snap_line_ends(&piece, a, b)
                } else {
                    geometry::straight_line(a, b)
                };
                network.links.insert(
                    next_link_id,
                    NetworkLink {
                        link_id: next_link_id,
                        from,
                        to,
                        geometry: piece,
                        code: line.code.clone(),
                        name: line.name.clone(),
                    },
                );
                next_link_id += 1;
            }
        }

        if network.links.is_empty() {
            return Err(Error::EmptyNetwork {
                stage: Stage::Network,
            });
        }

        let used: ahash::AHashSet<NetworkNodeId> = network
            .links
            .values()
            .flat_map(|l| [l.from, l.to])
            .collect();
        for (node_id, point) in node_points {
            if used.contains(&node_id) {
                network.nodes.insert(
                    node_id,
                    NetworkNode {
                        node_id,
                        point,
                        class: NodeClass::Connection,
                    },
                );
            }
        }
        network.classify();
        info!(
            nodes = network.nodes.len(),
            links = network.links.len(),
            "Built network"
        );
        Ok(network)
    }

    /// Recomputes the topology class of every node from link directions.
    pub fn classify(&mut self) {
        let mut degrees: AHashMap<NetworkNodeId, (usize, usize)> = AHashMap::new();
        for link in self.links.values() {
            degrees.entry(link.from).or_default().1 += 1;
            degrees.entry(link.to).or_default().0 += 1;
        }
        for node in self.nodes.values_mut() {
            let (incoming, outgoing) = degrees.get(&node.node_id).copied().unwrap_or((0, 0));
            node.class = match (incoming, outgoing) {
                (0, o) if o >= 1 => NodeClass::UpstreamBoundary,
                (i, 0) if i >= 1 => NodeClass::DownstreamBoundary,
                _ => NodeClass::Connection,
            };
        }
    }

    pub fn nodes_of_class(&self, class: NodeClass) -> Vec<NetworkNodeId> {
        self.nodes
            .values()
            .filter(|n| n.class == class)
            .map(|n| n.node_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::line_string;

    fn build(lines: Vec<LineString>) -> (Network, Report) {
        let mut report = Report::new();
        let input = lines.into_iter().map(InputLine::new).collect();
        let network = Network::from_lines(input, &NetworkConfig::default(), &mut report).unwrap();
        (network, report)
    }

    #[test]
    fn test_two_lines_share_a_node() {
        let (network, _) = build(vec![
            line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0)],
            line_string![(x: 10.005, y: 0.0), (x: 20.0, y: 0.0)],
        ]);
        assert_eq!(network.nodes.len(), 3);
        assert_eq!(network.links.len(), 2);
        assert_eq!(network.nodes_of_class(NodeClass::UpstreamBoundary), vec![1]);
        assert_eq!(network.nodes_of_class(NodeClass::Connection), vec![2]);
        let l1 = &network.links[&1];
        let l2 = &network.links[&2];
        assert_eq!(l1.to, l2.from);
        assert_eq!(l1.geometry.0.last(), l2.geometry.0.first());
    }

    #[test]
    fn test_line_split_where_another_line_touches() {
        // tributary ends on the middle of the main line
        let (network, _) = build(vec![
            line_string![(x: 0.0, y: 0.0), (x: 20.0, y: 0.0)],
            line_string![(x: 10.0, y: 10.0), (x: 10.0, y: 0.0)],
        ]);
        assert_eq!(network.links.len(), 3);
        let junction = network
            .nodes
            .values()
            .find(|n| geometry::distance(n.point, Coord { x: 10.0, y: 0.0 }) < 1e-9)
            .unwrap();
        let incoming = network.links.values().filter(|l| l.to == junction.node_id).count();
        assert_eq!(incoming, 2);
        let total: f64 = network.links.values().map(|l| l.length()).sum();
        assert!((total - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_closed_loop_gets_two_nodes() {
        let (network, _) = build(vec![line_string![
            (x: 0.0, y: 0.0),
            (x: 10.0, y: 0.0),
            (x: 10.0, y: 10.0),
            (x: 0.0, y: 10.0),
            (x: 0.0, y: 0.0),
        ]]);
        assert_eq!(network.nodes.len(), 2);
        assert_eq!(network.links.len(), 2);
    }

    #[test]
    fn test_short_line_is_discarded_once() {
        let mut report = Report::new();
        let input = vec![
            InputLine::new(line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)]),
            InputLine::new(line_string![(x: 500.0, y: 0.0), (x: 500.005, y: 0.0)]),
        ];
        let network = Network::from_lines(input, &NetworkConfig::default(), &mut report).unwrap();
        assert_eq!(network.links.len(), 1);
        assert_eq!(network.nodes.len(), 2);
        assert_eq!(report.count(FindingKind::DiscardedLine), 1);
    }

    #[test]
    fn test_invalid_line_is_reported() {
        let mut report = Report::new();
        let input = vec![
            InputLine::new(line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0)]),
            InputLine::new(line_string![(x: 5.0, y: 5.0), (x: 5.0, y: 5.0)]),
        ];
        let network = Network::from_lines(input, &NetworkConfig::default(), &mut report).unwrap();
        assert_eq!(network.links.len(), 1);
        assert_eq!(report.count(FindingKind::InvalidGeometry), 1);
    }

    #[test]
    fn test_empty_network() {
        let mut report = Report::new();
        let result = Network::from_lines(vec![], &NetworkConfig::default(), &mut report);
        assert!(matches!(result, Err(Error::EmptyNetwork { .. })));
    }
}
