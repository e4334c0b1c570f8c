//! Turns a water-course network plus structure and boundary locations into a
//! model: structures become connector nodes, the reaches between them
//! become basins.

use super::{Network, NetworkLinkId, NetworkNodeId, NodeClass};
use crate::context::Crs;
use crate::error::Result;
use crate::geometry::{self, Coord, Point};
use crate::model::node::{META_CODE, Meta};
use crate::model::{LinkType, Model, NodeId, NodeType};
use crate::report::{FindingKind, Report, Stage};
use ahash::AHashMap;
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ModelBuilderConfig {
    /// Max distance between a structure point and the water course (m)
    pub structure_snap_distance: f64,
    /// Structures this close to a network node take that node (m)
    pub structure_align_distance: f64,
    /// Max distance between a boundary point and a network end node (m)
    pub boundary_snap_distance: f64,
    /// Offset of a boundary node that coincides with its connector (m)
    pub boundary_offset: f64,
}

impl Default for ModelBuilderConfig {
    fn default() -> Self {
        Self {
            structure_snap_distance: 10.0,
            structure_align_distance: 0.5,
            boundary_snap_distance: 25.0,
            boundary_offset: 10.0,
        }
    }
}

/// Structure delivered as a point (gemaal, stuw, duiker, ...).
#[derive(Debug, Clone)]
pub struct StructurePoint {
    pub geometry: Point,
    pub node_type: NodeType,
    pub code: Option<String>,
    pub name: Option<String>,
    pub meta: Meta,
}

/// Model boundary delivered as a point.
#[derive(Debug, Clone)]
pub struct BoundaryPoint {
    pub geometry: Point,
    pub node_type: NodeType,
    pub code: Option<String>,
    pub name: Option<String>,
    pub meta: Meta,
}

fn find(parent: &mut AHashMap<NetworkLinkId, NetworkLinkId>, x: NetworkLinkId) -> NetworkLinkId {
    let mut root = x;
    while let Some(&p) = parent.get(&root) {
        if p == root {
            break;
        }
        root = p;
    }
    let mut current = x;
    while current != root {
        let next = parent.get(&current).copied().unwrap_or(root);
        parent.insert(current, root);
        current = next;
    }
    root
}

fn union(parent: &mut AHashMap<NetworkLinkId, NetworkLinkId>, a: NetworkLinkId, b: NetworkLinkId) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        // smallest link id is the root
        let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
        parent.insert(hi, lo);
    }
}

fn meta_with(meta: &Meta, code: &Option<String>) -> Meta {
    let mut meta = meta.clone();
    if let Some(code) = code {
        meta.insert(META_CODE.to_string(), code.clone().into());
    }
    meta
}

/// Builds the model skeleton. Structures farther than the snap distance
/// from the network, and boundaries without a nearby end node, are reported
/// and left out.
pub fn build_model(
    mut network: Network,
    structures: &[StructurePoint],
    boundaries: &[BoundaryPoint],
    crs: Crs,
    config: &ModelBuilderConfig,
    report: &mut Report,
) -> Result<Model> {
    // --- place structures on the network ---
    let mut structure_at: BTreeMap<NetworkNodeId, usize> = BTreeMap::new();
    for (idx, structure) in structures.iter().enumerate() {
        let point = structure.geometry.0;
        let Some(&(link_id, d)) = network.links_by_distance(point, 1).first() else {
            continue;
        };
        if d > config.structure_snap_distance {
            report.push(
                Stage::Ingest,
                FindingKind::UnplacedStructure,
                vec![],
                format!(
                    "structure {:?} lies {:.1} m from the nearest water course",
                    structure.code, d
                ),
            );
            continue;
        }
        let Some(net_node) = network.snap_to_link(link_id, point, config.structure_align_distance, 0.0) else {
            continue;
        };
        if structure_at.contains_key(&net_node) {
            report.push(
                Stage::Ingest,
                FindingKind::UnplacedStructure,
                vec![],
                format!("structure {:?} coincides with another structure", structure.code),
            );
            continue;
        }
        structure_at.insert(net_node, idx);
    }
    network.classify();

    // --- reaches: links joined at every node that is not a structure ---
    let mut incident: BTreeMap<NetworkNodeId, Vec<NetworkLinkId>> = BTreeMap::new();
    for link in network.links.values() {
        incident.entry(link.from).or_default().push(link.link_id);
        incident.entry(link.to).or_default().push(link.link_id);
    }
    let mut parent: AHashMap<NetworkLinkId, NetworkLinkId> =
        network.links.keys().map(|id| (*id, *id)).collect();
    for (node_id, links) in &incident {
        if structure_at.contains_key(node_id) {
            continue;
        }
        for pair in links.windows(2) {
            union(&mut parent, pair[0], pair[1]);
        }
    }
    let mut reaches: BTreeMap<NetworkLinkId, Vec<NetworkLinkId>> = BTreeMap::new();
    let link_ids: Vec<NetworkLinkId> = network.links.keys().copied().collect();
    for link_id in link_ids {
        let root = find(&mut parent, link_id);
        reaches.entry(root).or_default().push(link_id);
    }

    let mut model = Model::new(crs);

    // --- one basin per reach ---
    let mut basin_of_reach: BTreeMap<NetworkLinkId, NodeId> = BTreeMap::new();
    for (root, members) in &reaches {
        let longest = members
            .iter()
            .filter_map(|id| network.links.get(id))
            .max_by(|a, b| a.length().total_cmp(&b.length()).then(b.link_id.cmp(&a.link_id)));
        let Some(longest) = longest else {
            continue;
        };
        let Some(mid) = geometry::interpolate(&longest.geometry, longest.length() / 2.0) else {
            continue;
        };
        let basin = model.add_node(NodeType::Basin, Point(mid));
        if let Some(node) = model.node_mut(basin) {
            node.name = longest.name.clone();
            node.meta = meta_with(&Meta::new(), &longest.code);
        }
        basin_of_reach.insert(*root, basin);
    }

    let reach_of_link = |parent: &mut AHashMap<NetworkLinkId, NetworkLinkId>, link_id| {
        let root = find(parent, link_id);
        basin_of_reach.get(&root).copied()
    };

    // --- connectors ---
    let mut connector_of: BTreeMap<NetworkNodeId, NodeId> = BTreeMap::new();
    for (net_node, idx) in &structure_at {
        let structure = &structures[*idx];
        let point = network.nodes[net_node].point;
        let connector = model.add_node(structure.node_type, Point(point));
        if let Some(node) = model.node_mut(connector) {
            node.name = structure.name.clone();
            node.meta = meta_with(&structure.meta, &structure.code);
        }
        connector_of.insert(*net_node, connector);

        let mut upstream: Vec<NodeId> = Vec::new();
        let mut downstream: Vec<NodeId> = Vec::new();
        for link_id in incident.get(net_node).map(|v| v.as_slice()).unwrap_or(&[]) {
            let Some(link) = network.links.get(link_id) else {
                continue;
            };
            let Some(basin) = reach_of_link(&mut parent, *link_id) else {
                continue;
            };
            if link.to == *net_node {
                upstream.push(basin);
            } else {
                downstream.push(basin);
            }
        }
        upstream.sort();
        upstream.dedup();
        downstream.sort();
        downstream.dedup();
        for basin in upstream {
            model.add_link(basin, connector, LinkType::Flow)?;
        }
        for basin in downstream {
            model.add_link(connector, basin, LinkType::Flow)?;
        }
        model.add_default_rows(connector, structure.node_type, None);
    }

    // --- boundaries ---
    for boundary in boundaries {
        let point = boundary.geometry.0;
        let Some((net_node, d)) = network.nearest_node(point) else {
            continue;
        };
        if d > config.boundary_snap_distance {
            report.push(
                Stage::Ingest,
                FindingKind::UnplacedStructure,
                vec![],
                format!("boundary {:?} lies {:.1} m from the nearest network node", boundary.code, d),
            );
            continue;
        }
        let class = network.nodes[&net_node].class;
        let net_point = network.nodes[&net_node].point;
        let outflow = boundary.node_type == NodeType::Terminal
            || (class != NodeClass::UpstreamBoundary && boundary.node_type != NodeType::FlowBoundary);

        let boundary_point = if geometry::distance(point, net_point) < 1.0 {
            boundary_offset_point(&network, net_node, config.boundary_offset)
        } else {
            point
        };
        let boundary_id = model.add_node(boundary.node_type, Point(boundary_point));
        if let Some(node) = model.node_mut(boundary_id) {
            node.name = boundary.name.clone();
            node.meta = meta_with(&boundary.meta, &boundary.code);
        }
        model.add_default_rows(boundary_id, boundary.node_type, None);

        let connector = match connector_of.get(&net_node) {
            Some(c) => *c,
            None => {
                let Some(basin) = incident
                    .get(&net_node)
                    .and_then(|links| links.first())
                    .and_then(|link_id| reach_of_link(&mut parent, *link_id))
                else {
                    continue;
                };
                let outlet = model.add_node(NodeType::Outlet, Point(net_point));
                model.add_default_rows(outlet, NodeType::Outlet, None);
                if outflow {
                    model.add_link(basin, outlet, LinkType::Flow)?;
                } else {
                    model.add_link(outlet, basin, LinkType::Flow)?;
                }
                outlet
            }
        };
        if outflow {
            model.add_link(connector, boundary_id, LinkType::Flow)?;
        } else {
            model.add_link(boundary_id, connector, LinkType::Flow)?;
        }
    }

    info!(
        basins = basin_of_reach.len(),
        connectors = connector_of.len(),
        "Assembled model from network"
    );
    Ok(model)
}

/// Point `offset` metres beyond a network end node, continuing the
/// direction of its link.
fn boundary_offset_point(network: &Network, net_node: NetworkNodeId, offset: f64) -> Coord {
    let here = network.nodes[&net_node].point;
    let neighbour = network
        .links
        .values()
        .find_map(|l| {
            let coords = &l.geometry.0;
            if l.to == net_node {
                coords.len().checked_sub(2).and_then(|i| coords.get(i)).copied()
            } else if l.from == net_node {
                coords.get(1).copied()
            } else {
                None
            }
        })
        .unwrap_or(Coord { x: here.x - 1.0, y: here.y });
    let dx = here.x - neighbour.x;
    let dy = here.y - neighbour.y;
    let len = dx.hypot(dy);
    if len == 0.0 {
        return Coord { x: here.x + offset, y: here.y };
    }
    Coord {
        x: here.x + dx / len * offset,
        y: here.y + dy / len * offset,
    }
}
