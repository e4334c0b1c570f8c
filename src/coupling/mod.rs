//! Couples the per-authority parts of a concatenated model. Every boundary
//! flagged with a partner authority is replaced by a link from its connector
//! to the partner's nearest basin, drawn along the backbone network.

pub mod routing;

use crate::authority::{Authority, NEVER_COUPLED};
use crate::error::Result;
use crate::geometry::{self, Coord, LineString, MultiPolygon};
use crate::model::node::{META_AUTHORITY, META_COUPLE_AUTHORITY, META_FROM_AUTHORITY, META_TO_AUTHORITY};
use crate::model::{LinkType, MetaValue, Model, NodeId, NodeType};
use crate::network::Network;
use crate::report::{FindingKind, Report, Stage};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct CouplingConfig {
    /// Boundaries of two authorities closer than this are merged (m)
    pub merge_distance: f64,
    /// Route starts at a backbone link end within this distance (m)
    pub align_distance: f64,
    /// Route starts at an existing backbone vertex within this distance (m)
    pub max_snap_distance: f64,
    /// Backbone links tried as route start
    pub max_candidate_links: usize,
    /// Own coverage is shrunk by this before testing route crossings (m)
    pub mask_tolerance: f64,
}

impl Default for CouplingConfig {
    fn default() -> Self {
        Self {
            merge_distance: 20.0,
            align_distance: 10.0,
            max_snap_distance: 9.0,
            max_candidate_links: 5,
            mask_tolerance: 25.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CouplingSummary {
    pub coupled: usize,
    pub merged: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Canonical authority name; unknown names pass through.
fn canonical(name: &str) -> String {
    name.parse::<Authority>()
        .map(|a| a.name().to_string())
        .unwrap_or_else(|_| name.to_string())
}

fn authority_of(model: &Model, node_id: NodeId) -> Option<String> {
    model
        .node(node_id)
        .and_then(|n| n.meta_str(META_AUTHORITY))
        .map(canonical)
}

/// Connector next to a boundary and whether it flows into the boundary.
struct Attachment {
    connector: NodeId,
    into_boundary: bool,
}

fn attachments(model: &Model, boundary: NodeId) -> Vec<Attachment> {
    let upstream = model.upstream_node_ids(boundary).into_iter().map(|c| Attachment {
        connector: c,
        into_boundary: true,
    });
    let downstream = model.downstream_node_ids(boundary).into_iter().map(|c| Attachment {
        connector: c,
        into_boundary: false,
    });
    upstream.chain(downstream).collect()
}

/// Basin on the far side of `connector`, seen from `boundary`.
fn far_basin(model: &Model, connector: NodeId, boundary: NodeId) -> Option<NodeId> {
    model
        .upstream_node_ids(connector)
        .into_iter()
        .chain(model.downstream_node_ids(connector))
        .find(|id| *id != boundary && model.node_type(*id) == Some(NodeType::Basin))
}

/// Union of the basin areas of one authority.
pub fn coverage(model: &Model, authority: &str) -> MultiPolygon {
    let parts: Vec<&MultiPolygon> = model
        .basin_areas
        .iter()
        .filter(|a| authority_of(model, a.node_id).as_deref() == Some(authority))
        .map(|a| &a.geometry)
        .collect();
    geometry::polygon::union_all(parts)
}

/// Basin of `authority` whose area centroid (or node, without area) lies
/// nearest `point`.
pub fn nearest_basin(model: &Model, authority: &str, point: Coord) -> Option<NodeId> {
    let candidates = model
        .nodes_of_type(NodeType::Basin)
        .filter(|n| authority_of(model, n.node_id).as_deref() == Some(authority))
        .map(|n| {
            let c = model
                .basin_area(n.node_id)
                .and_then(|a| geometry::polygon::centroid(&a.geometry))
                .unwrap_or(n.geometry.0);
            (n.node_id, c)
        });
    geometry::nearest(point, candidates)
}

fn stamp_link(model: &mut Model, link_id: crate::model::LinkId, from: &str, to: &str) {
    if let Some(link) = model.links.get_mut(&link_id) {
        link.meta
            .insert(META_FROM_AUTHORITY.to_string(), MetaValue::Text(from.to_string()));
        link.meta
            .insert(META_TO_AUTHORITY.to_string(), MetaValue::Text(to.to_string()));
    }
}

/// Links `connector` to `basin` in the direction it had towards the
/// boundary it replaces.
fn connect(
    model: &mut Model,
    attachment: &Attachment,
    basin: NodeId,
    geometry: Option<LineString>,
) -> Result<crate::model::LinkId> {
    if attachment.into_boundary {
        model.add_link_with_geometry(attachment.connector, basin, LinkType::Flow, geometry)
    } else {
        let geometry = geometry.map(|g| geometry::reversed(&g));
        model.add_link_with_geometry(basin, attachment.connector, LinkType::Flow, geometry)
    }
}

/// Partner boundary within the merge distance that couples back to `own`.
fn mirrored_boundary(
    model: &Model,
    boundary: NodeId,
    own: &str,
    partner: &str,
    config: &CouplingConfig,
) -> Option<NodeId> {
    let at = model.node_coord(boundary)?;
    let candidates = model
        .nodes
        .values()
        .filter(|n| n.node_id != boundary && n.node_type.is_boundary())
        .filter(|n| authority_of(model, n.node_id).as_deref() == Some(partner))
        .filter(|n| n.meta_str(META_COUPLE_AUTHORITY).map(canonical).as_deref() == Some(own))
        .filter(|n| geometry::distance(n.geometry.0, at) <= config.merge_distance)
        .map(|n| (n.node_id, n.geometry.0));
    geometry::nearest(at, candidates)
}

/// Joins two mirrored boundaries: each connector is relinked to the basin
/// behind the other connector and both boundaries are removed.
fn merge_boundaries(model: &mut Model, a: NodeId, b: NodeId, own: &str, partner: &str) -> Result<bool> {
    let side_a = attachments(model, a);
    let side_b = attachments(model, b);
    let basin_behind = |model: &Model, side: &[Attachment], boundary: NodeId| {
        side.first().and_then(|s| far_basin(model, s.connector, boundary))
    };
    let (Some(basin_a), Some(basin_b)) = (basin_behind(model, &side_a, a), basin_behind(model, &side_b, b)) else {
        return Ok(false);
    };
    for (side, basin, from, to) in [(&side_a, basin_b, own, partner), (&side_b, basin_a, partner, own)] {
        for attachment in side {
            let link_id = connect(model, attachment, basin, None)?;
            let (f, t) = if attachment.into_boundary { (from, to) } else { (to, from) };
            stamp_link(model, link_id, f, t);
        }
    }
    model.tables.rewire_listen_node(a, basin_b);
    model.tables.rewire_listen_node(b, basin_a);
    model.remove_node(a);
    model.remove_node(b);
    Ok(true)
}

/// Couples every flagged boundary. Boundaries that cannot be coupled stay
/// in place and are reported.
pub fn couple(
    model: &mut Model,
    backbone: &mut Network,
    config: &CouplingConfig,
    report: &mut Report,
) -> Result<CouplingSummary> {
    let mut summary = CouplingSummary::default();
    let mut masks: BTreeMap<String, MultiPolygon> = BTreeMap::new();
    let mut done: BTreeSet<NodeId> = BTreeSet::new();

    let flagged: Vec<(NodeId, String)> = model
        .nodes
        .values()
        .filter(|n| n.node_type.is_boundary())
        .filter_map(|n| Some((n.node_id, n.meta_str(META_COUPLE_AUTHORITY)?.to_string())))
        .collect();

    for (boundary, partner) in flagged {
        if done.contains(&boundary) || model.node(boundary).is_none() {
            continue;
        }
        if NEVER_COUPLED.iter().any(|n| n.eq_ignore_ascii_case(partner.trim())) {
            summary.skipped += 1;
            report.push(
                Stage::Coupling,
                FindingKind::CouplingSkipped,
                vec![boundary],
                format!("boundary marks the model edge ({partner})"),
            );
            continue;
        }
        let partner = canonical(&partner);
        let Some(own) = authority_of(model, boundary) else {
            summary.failed += 1;
            report.push(Stage::Coupling, FindingKind::CouplingFailed, vec![boundary], "boundary has no authority");
            continue;
        };
        if own == partner {
            summary.skipped += 1;
            report.push(
                Stage::Coupling,
                FindingKind::CouplingSkipped,
                vec![boundary],
                "boundary couples to its own authority",
            );
            continue;
        }

        if let Some(mirror) = mirrored_boundary(model, boundary, &own, &partner, config) {
            if merge_boundaries(model, boundary, mirror, &own, &partner)? {
                done.insert(mirror);
                summary.merged += 1;
                report.push(
                    Stage::Coupling,
                    FindingKind::Coupled,
                    vec![boundary, mirror],
                    format!("merged boundaries of {own} and {partner}"),
                );
                continue;
            }
        }

        let side = attachments(model, boundary);
        let Some(at) = model.node_coord(boundary) else {
            continue;
        };
        let Some(remote) = nearest_basin(model, &partner, at) else {
            summary.failed += 1;
            report.push(
                Stage::Coupling,
                FindingKind::CouplingFailed,
                vec![boundary],
                format!("no basin of {partner} to couple to"),
            );
            continue;
        };
        if side.is_empty() {
            summary.failed += 1;
            report.push(Stage::Coupling, FindingKind::CouplingFailed, vec![boundary], "boundary has no connector");
            continue;
        }
        let remote_at = model
            .node_coord(remote)
            .or_else(|| model.basin_area(remote).and_then(|a| geometry::polygon::centroid(&a.geometry)))
            .unwrap_or(at);
        let mask = masks
            .entry(own.clone())
            .or_insert_with(|| routing::shrink_mask(&coverage(model, &own), config.mask_tolerance))
            .clone();

        let mut routes = Vec::with_capacity(side.len());
        for attachment in &side {
            let Some(from) = model.node_coord(attachment.connector) else {
                continue;
            };
            let line = if backbone.links.is_empty() {
                Some(geometry::straight_line(from, remote_at))
            } else {
                routing::route(backbone, from, remote_at, &mask, config)
            };
            routes.push(line);
        }
        if routes.iter().any(Option::is_none) || routes.len() != side.len() {
            summary.failed += 1;
            report.push(
                Stage::Coupling,
                FindingKind::CouplingFailed,
                vec![boundary, remote],
                format!("no backbone route from {own} to {partner} basin {remote}"),
            );
            continue;
        }

        for (attachment, line) in side.iter().zip(routes) {
            let link_id = connect(model, attachment, remote, line)?;
            let (f, t) = if attachment.into_boundary {
                (own.as_str(), partner.as_str())
            } else {
                (partner.as_str(), own.as_str())
            };
            stamp_link(model, link_id, f, t);
            debug!(connector = attachment.connector, remote, link_id, "Coupled connector");
        }
        model.tables.rewire_listen_node(boundary, remote);
        model.remove_node(boundary);
        summary.coupled += 1;
        report.push(
            Stage::Coupling,
            FindingKind::Coupled,
            vec![boundary, remote],
            format!("coupled {own} to {partner}"),
        );
    }
    info!(
        coupled = summary.coupled,
        merged = summary.merged,
        skipped = summary.skipped,
        failed = summary.failed,
        "Coupled authorities"
    );
    Ok(summary)
}
