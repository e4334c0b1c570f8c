//! Attribution of delivered area polygons to basin nodes.
//!
//! Every candidate polygon is given to one basin: its explicit `node_id`,
//! an edit-script override, the basin area it overlaps most, or the nearest
//! basin within a cap. The assigned polygons are dissolved per basin and
//! cleaned so that no two basins overlap.

use crate::geometry::index::EnvelopeIndex;
use crate::geometry::{self, MultiPolygon, polygon};
use crate::model::node::{META_CODE, META_STREEFPEIL};
use crate::model::{BasinArea, Meta, MetaValue, Model, NodeId, NodeType};
use crate::report::{FindingKind, Report, Stage};
use geo::{BoundingRect, Contains};
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct AreaResolverConfig {
    /// Overlap fraction below which a second layer is consulted
    pub min_overlap_fraction: f64,
    /// Cap on the nearest-basin fallback (m)
    pub max_fallback_distance: f64,
    /// Interior rings smaller than this are filled (m²)
    pub min_hole_area: f64,
    /// Parts smaller than this are erased (m²)
    pub min_part_area: f64,
}

impl Default for AreaResolverConfig {
    fn default() -> Self {
        Self {
            min_overlap_fraction: 0.95,
            max_fallback_distance: 500.0,
            min_hole_area: 1000.0,
            min_part_area: 1000.0,
        }
    }
}

/// Area polygon from a delivery.
#[derive(Debug, Clone)]
pub struct CandidateArea {
    pub geometry: MultiPolygon,
    pub code: Option<String>,
    /// Basin this polygon already belongs to
    pub node_id: Option<NodeId>,
    pub streefpeil: Option<f64>,
}

impl CandidateArea {
    pub fn new(geometry: MultiPolygon) -> Self {
        Self {
            geometry,
            code: None,
            node_id: None,
            streefpeil: None,
        }
    }
}

/// `add_basin_area` row of an edit script that names the candidate by code.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaOverride {
    pub node_id: NodeId,
    pub add_area_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentMethod {
    Explicit,
    Override,
    Overlap,
    SecondLayer,
    Containment,
    Nearest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Index of the exploded candidate polygon
    pub candidate: usize,
    pub node_id: NodeId,
    pub overlap_fraction: f64,
    pub method: AssignmentMethod,
}

struct Reference<'a> {
    areas: &'a [BasinArea],
    index: EnvelopeIndex<usize>,
}

impl<'a> Reference<'a> {
    fn new(areas: &'a [BasinArea]) -> Self {
        Self {
            areas,
            index: EnvelopeIndex::from_polygons(areas.iter().enumerate().map(|(i, a)| (i, &a.geometry))),
        }
    }

    /// Basin with the largest overlap and that overlap in m². Ties go to the
    /// lowest node id.
    fn best_overlap(&self, geometry: &MultiPolygon, allowed: Option<&BTreeSet<NodeId>>) -> Option<(NodeId, f64)> {
        let rect = geometry.bounding_rect()?;
        let mut per_node: BTreeMap<NodeId, f64> = BTreeMap::new();
        for i in self.index.intersecting(rect, 0.0) {
            let area = &self.areas[i];
            if allowed.is_some_and(|set| !set.contains(&area.node_id)) {
                continue;
            }
            let overlap = polygon::overlap_area(geometry, &area.geometry);
            if overlap > 0.0 {
                *per_node.entry(area.node_id).or_default() += overlap;
            }
        }
        per_node
            .into_iter()
            .fold(None, |best: Option<(NodeId, f64)>, (node_id, overlap)| match best {
                Some((_, b)) if b >= overlap => best,
                _ => Some((node_id, overlap)),
            })
    }
}

fn basin_code(model: &Model, area: &BasinArea) -> Option<String> {
    area.meta
        .get(META_CODE)
        .and_then(|v| v.as_str())
        .or_else(|| model.node(area.node_id).and_then(|n| n.code()))
        .map(str::to_string)
}

/// Replaces the basin areas of `model` with the resolved candidates.
///
/// Basins that receive no candidate keep the area they already had.
/// Unplaceable candidates are dropped and reported as
/// `UnassignedBasinArea`; basins left without any area as
/// `BasinWithoutArea`.
pub fn resolve_basin_areas(
    model: &mut Model,
    candidates: &[CandidateArea],
    second_layer: Option<&[BasinArea]>,
    overrides: &[AreaOverride],
    config: &AreaResolverConfig,
    report: &mut Report,
) -> Vec<Assignment> {
    let basins: BTreeSet<NodeId> = model.node_ids_of_type(NodeType::Basin).into_iter().collect();

    // explode into single polygons, repairing or dropping invalid ones
    let mut exploded: Vec<CandidateArea> = Vec::new();
    for (i, candidate) in candidates.iter().enumerate() {
        let Some(repaired) = polygon::repair(&candidate.geometry) else {
            report.push(
                Stage::BasinArea,
                FindingKind::InvalidGeometry,
                vec![],
                format!("area candidate {i} ({:?}) has no valid geometry", candidate.code),
            );
            continue;
        };
        for part in polygon::explode(&repaired) {
            exploded.push(CandidateArea {
                geometry: MultiPolygon::new(vec![part]),
                ..candidate.clone()
            });
        }
    }

    let previous: Vec<BasinArea> = model
        .basin_areas
        .iter()
        .filter(|a| basins.contains(&a.node_id))
        .cloned()
        .collect();
    let primary = Reference::new(&previous);
    let secondary = second_layer.map(Reference::new);

    let mut by_code: BTreeMap<String, BTreeSet<NodeId>> = BTreeMap::new();
    for area in &previous {
        if let Some(code) = basin_code(model, area) {
            by_code.entry(code).or_default().insert(area.node_id);
        }
    }
    let override_of: BTreeMap<&str, NodeId> = overrides
        .iter()
        .filter(|o| {
            let ok = basins.contains(&o.node_id);
            if !ok {
                report.push(
                    Stage::BasinArea,
                    FindingKind::UnassignedBasinArea,
                    vec![o.node_id],
                    format!("override for '{}' names node {} which is not a basin", o.add_area_code, o.node_id),
                );
            }
            ok
        })
        .map(|o| (o.add_area_code.as_str(), o.node_id))
        .collect();

    // centroid of the current area per basin, the node itself without one
    let basin_centroids: Vec<(NodeId, geometry::Coord)> = model
        .nodes_of_type(NodeType::Basin)
        .map(|n| {
            let at = previous
                .iter()
                .find(|a| a.node_id == n.node_id)
                .and_then(|a| polygon::centroid(&a.geometry))
                .unwrap_or(n.geometry.0);
            (n.node_id, at)
        })
        .collect();

    let mut assignments: Vec<Assignment> = Vec::new();
    for (i, candidate) in exploded.iter().enumerate() {
        let size = polygon::area(&candidate.geometry);
        let assign = |node_id, overlap_fraction, method| Assignment {
            candidate: i,
            node_id,
            overlap_fraction,
            method,
        };

        if let Some(node_id) = candidate.node_id.filter(|id| basins.contains(id)) {
            assignments.push(assign(node_id, 1.0, AssignmentMethod::Explicit));
            continue;
        }
        if let Some(node_id) = candidate.code.as_deref().and_then(|c| override_of.get(c)) {
            assignments.push(assign(*node_id, 1.0, AssignmentMethod::Override));
            continue;
        }

        let allowed = candidate.code.as_ref().and_then(|c| by_code.get(c));
        let overlap = primary
            .best_overlap(&candidate.geometry, allowed)
            .or_else(|| allowed.and_then(|_| primary.best_overlap(&candidate.geometry, None)));
        if let Some((node_id, overlap)) = overlap {
            let fraction = overlap / size;
            if fraction >= config.min_overlap_fraction {
                assignments.push(assign(node_id, fraction, AssignmentMethod::Overlap));
                continue;
            }
            let retried = secondary
                .as_ref()
                .and_then(|s| s.best_overlap(&candidate.geometry, None))
                .map(|(id, o)| (id, o / size))
                .filter(|(id, f)| *f > fraction && basins.contains(id));
            if let Some((node_id, fraction)) = retried {
                assignments.push(assign(node_id, fraction, AssignmentMethod::SecondLayer));
                continue;
            }
            report.push(
                Stage::BasinArea,
                FindingKind::LowOverlap,
                vec![node_id],
                format!(
                    "area {:?} overlaps basin {node_id} for {:.1}% only",
                    candidate.code,
                    fraction * 100.0
                ),
            );
            assignments.push(assign(node_id, fraction, AssignmentMethod::Overlap));
            continue;
        }

        // no overlap at all: a basin node inside the polygon, else the nearest
        let inside = model
            .nodes_of_type(NodeType::Basin)
            .find(|n| candidate.geometry.contains(&n.geometry))
            .map(|n| n.node_id);
        if let Some(node_id) = inside {
            assignments.push(assign(node_id, 0.0, AssignmentMethod::Containment));
            continue;
        }
        let nearest = polygon::centroid(&candidate.geometry).and_then(|c| {
            let node_id = geometry::nearest(c, basin_centroids.iter().copied())?;
            let (_, at) = basin_centroids.iter().find(|(id, _)| *id == node_id)?;
            Some((node_id, geometry::distance(c, *at)))
        });
        match nearest {
            Some((node_id, d)) if d <= config.max_fallback_distance => {
                debug!(node_id, distance = d, "Assigned area to nearest basin");
                assignments.push(assign(node_id, 0.0, AssignmentMethod::Nearest));
            }
            _ => {
                report.push(
                    Stage::BasinArea,
                    FindingKind::UnassignedBasinArea,
                    vec![],
                    format!(
                        "area {:?} ({:.0} m²) is farther than {} m from any basin and was dropped",
                        candidate.code, size, config.max_fallback_distance
                    ),
                );
            }
        }
    }

    // dissolve per basin; basins without candidates keep their old area
    let assigned_nodes: BTreeSet<NodeId> = assignments.iter().map(|a| a.node_id).collect();
    let rows = assignments
        .iter()
        .map(|a| (a.node_id, exploded[a.candidate].geometry.clone()))
        .chain(
            previous
                .iter()
                .filter(|a| !assigned_nodes.contains(&a.node_id))
                .map(|a| (a.node_id, a.geometry.clone())),
        );
    let dissolved: BTreeMap<NodeId, MultiPolygon> = polygon::dissolve(rows)
        .into_iter()
        .chunk_by(|(node_id, _)| *node_id)
        .into_iter()
        .map(|(node_id, parts)| (node_id, MultiPolygon::new(parts.map(|(_, p)| p).collect())))
        .collect();

    let cleaned = clean_areas(dissolved, config);

    // streefpeil from the largest assigned candidate that carries one
    let mut levels: BTreeMap<NodeId, (f64, f64)> = BTreeMap::new();
    for a in &assignments {
        let candidate = &exploded[a.candidate];
        if let Some(level) = candidate.streefpeil {
            let size = polygon::area(&candidate.geometry);
            let entry = levels.entry(a.node_id).or_insert((size, level));
            if size > entry.0 {
                *entry = (size, level);
            }
        }
    }

    let mut areas: Vec<BasinArea> = Vec::with_capacity(cleaned.len());
    for (node_id, geometry) in cleaned {
        let mut meta: Meta = previous
            .iter()
            .find(|a| a.node_id == node_id)
            .map(|a| a.meta.clone())
            .unwrap_or_default();
        if let Some((_, level)) = levels.get(&node_id) {
            meta.insert(META_STREEFPEIL.to_string(), MetaValue::Float(*level));
        }
        areas.push(BasinArea { node_id, geometry, meta });
    }
    model.basin_areas = areas;
    for (node_id, (_, level)) in &levels {
        model.set_target_level(*node_id, *level);
    }

    for basin in &basins {
        if model.basin_area(*basin).is_none() {
            report.push(
                Stage::BasinArea,
                FindingKind::BasinWithoutArea,
                vec![*basin],
                format!("basin {basin} has no area"),
            );
        }
    }
    info!(
        candidates = exploded.len(),
        assigned = assignments.len(),
        basins_with_area = model.basin_areas.len(),
        "Resolved basin areas"
    );
    assignments
}

/// Removes overlaps between basins (lowest node id wins), fills small holes
/// and erases small parts.
pub fn clean_areas(areas: BTreeMap<NodeId, MultiPolygon>, config: &AreaResolverConfig) -> BTreeMap<NodeId, MultiPolygon> {
    let disjoint = remove_overlaps(areas);
    let index = EnvelopeIndex::from_polygons(disjoint.iter().map(|(id, mp)| (*id, mp)));

    let mut filled: BTreeMap<NodeId, MultiPolygon> = BTreeMap::new();
    for (node_id, mp) in &disjoint {
        let mut out = polygon::fill_small_holes(mp, config.min_hole_area);
        if out != *mp {
            // a filled hole never takes area from a basin inside it
            if let Some(rect) = out.bounding_rect() {
                for other in index.intersecting(rect, 0.0) {
                    if other != *node_id {
                        out = polygon::difference(&out, &disjoint[&other]);
                    }
                }
            }
        }
        filled.insert(*node_id, out);
    }

    remove_overlaps(filled)
        .into_iter()
        .filter_map(|(node_id, mp)| {
            let kept = polygon::remove_small_parts(&mp, config.min_part_area);
            (!polygon::is_empty(&kept)).then_some((node_id, kept))
        })
        .collect()
}

/// Subtracts from every area the areas of lower node ids.
pub fn remove_overlaps(areas: BTreeMap<NodeId, MultiPolygon>) -> BTreeMap<NodeId, MultiPolygon> {
    let mut out: BTreeMap<NodeId, MultiPolygon> = BTreeMap::new();
    let mut accepted: EnvelopeIndex<NodeId> = EnvelopeIndex::new(std::iter::empty());
    for (node_id, mp) in areas {
        let mut remaining = mp;
        if let Some(rect) = remaining.bounding_rect() {
            for other in accepted.intersecting(rect, 0.0) {
                if polygon::overlap_area(&remaining, &out[&other]) > 0.0 {
                    remaining = polygon::difference(&remaining, &out[&other]);
                }
            }
        }
        if polygon::is_empty(&remaining) {
            continue;
        }
        if let Some(rect) = remaining.bounding_rect() {
            accepted.insert(node_id, rect);
        }
        out.insert(node_id, remaining);
    }
    out
}

/// Basin-area pairs overlapping by more than `tolerance` m².
pub fn overlapping_pairs(areas: &[BasinArea], tolerance: f64) -> Vec<(NodeId, NodeId, f64)> {
    let index = EnvelopeIndex::from_polygons(areas.iter().enumerate().map(|(i, a)| (i, &a.geometry)));
    let mut out = Vec::new();
    for (i, area) in areas.iter().enumerate() {
        let Some(rect) = area.geometry.bounding_rect() else {
            continue;
        };
        for j in index.intersecting(rect, 0.0) {
            if j <= i || areas[j].node_id == area.node_id {
                continue;
            }
            let overlap = polygon::overlap_area(&area.geometry, &areas[j].geometry);
            if overlap > tolerance {
                let (a, b) = (area.node_id.min(areas[j].node_id), area.node_id.max(areas[j].node_id));
                out.push((a, b, overlap));
            }
        }
    }
    out.sort_by(|x, y| (x.0, x.1).cmp(&(y.0, y.1)));
    out
}
