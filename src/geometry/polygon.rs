//! Polygon operations used for basin areas and coverage masks.

use super::{Coord, Geometry, LineString, MultiPolygon, Point, Polygon, distance, is_finite};
use geo::{Area, BooleanOps, BoundingRect, Centroid, Contains, InteriorPoint};
use std::collections::BTreeMap;

pub fn empty() -> MultiPolygon {
    MultiPolygon::new(vec![])
}

pub fn area(mp: &MultiPolygon) -> f64 {
    mp.unsigned_area()
}

pub fn is_empty(mp: &MultiPolygon) -> bool {
    mp.0.is_empty() || area(mp) <= 0.0
}

/// Converts (multi)polygon geometries into a MultiPolygon.
pub fn to_multi(geometry: &Geometry) -> Option<MultiPolygon> {
    match geometry {
        Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p.clone()])),
        Geometry::MultiPolygon(mp) => Some(mp.clone()),
        Geometry::GeometryCollection(gc) => {
            let parts: Vec<Polygon> = gc
                .0
                .iter()
                .filter_map(to_multi)
                .flat_map(|mp| mp.0)
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(MultiPolygon::new(parts))
            }
        }
        _ => None,
    }
}

fn ring_is_finite(ring: &LineString) -> bool {
    ring.0.iter().all(|c| is_finite(*c))
}

/// Repairs a polygon the way a zero-width buffer does: non-finite rings are
/// dropped and the remainder is re-noded through a boolean union. `None`
/// when nothing with positive area survives.
pub fn repair(mp: &MultiPolygon) -> Option<MultiPolygon> {
    let cleaned: Vec<Polygon> = mp
        .0
        .iter()
        .filter(|p| p.exterior().0.len() >= 4 && ring_is_finite(p.exterior()))
        .map(|p| {
            let interiors: Vec<LineString> = p
                .interiors()
                .iter()
                .filter(|r| r.0.len() >= 4 && ring_is_finite(r))
                .cloned()
                .collect();
            Polygon::new(p.exterior().clone(), interiors)
        })
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let repaired = MultiPolygon::new(cleaned).union(&empty());
    if is_empty(&repaired) {
        None
    } else {
        Some(repaired)
    }
}

pub fn union(a: &MultiPolygon, b: &MultiPolygon) -> MultiPolygon {
    if a.0.is_empty() {
        return b.clone();
    }
    if b.0.is_empty() {
        return a.clone();
    }
    a.union(b)
}

pub fn difference(a: &MultiPolygon, b: &MultiPolygon) -> MultiPolygon {
    if a.0.is_empty() || b.0.is_empty() {
        return a.clone();
    }
    a.difference(b)
}

pub fn intersection(a: &MultiPolygon, b: &MultiPolygon) -> MultiPolygon {
    if a.0.is_empty() || b.0.is_empty() {
        return empty();
    }
    a.intersection(b)
}

pub fn overlap_area(a: &MultiPolygon, b: &MultiPolygon) -> f64 {
    area(&intersection(a, b))
}

pub fn union_all<'a>(parts: impl IntoIterator<Item = &'a MultiPolygon>) -> MultiPolygon {
    parts.into_iter().fold(empty(), |acc, mp| union(&acc, mp))
}

pub fn explode(mp: &MultiPolygon) -> Vec<Polygon> {
    mp.0.clone()
}

/// Groups rows by key, unions each group and explodes the result back into
/// single polygons. Output is ordered by key.
pub fn dissolve<K: Ord>(rows: impl IntoIterator<Item = (K, MultiPolygon)>) -> Vec<(K, Polygon)>
where
    K: Clone,
{
    let mut groups: BTreeMap<K, MultiPolygon> = BTreeMap::new();
    for (key, mp) in rows {
        let merged = match groups.get(&key) {
            Some(existing) => union(existing, &mp),
            None => mp,
        };
        groups.insert(key, merged);
    }
    groups
        .into_iter()
        .flat_map(|(key, mp)| mp.0.into_iter().map(move |p| (key.clone(), p)))
        .collect()
}

/// Removes interior rings smaller than `max_hole_area`.
pub fn fill_small_holes(mp: &MultiPolygon, max_hole_area: f64) -> MultiPolygon {
    MultiPolygon::new(
        mp.0.iter()
            .map(|p| {
                let interiors: Vec<LineString> = p
                    .interiors()
                    .iter()
                    .filter(|ring| Polygon::new((*ring).clone(), vec![]).unsigned_area() >= max_hole_area)
                    .cloned()
                    .collect();
                Polygon::new(p.exterior().clone(), interiors)
            })
            .collect(),
    )
}

/// Drops parts smaller than `min_area`, always keeping the largest part.
pub fn remove_small_parts(mp: &MultiPolygon, min_area: f64) -> MultiPolygon {
    let largest = mp
        .0
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.unsigned_area().total_cmp(&b.unsigned_area()))
        .map(|(i, _)| i);
    MultiPolygon::new(
        mp.0.iter()
            .enumerate()
            .filter(|(i, p)| Some(*i) == largest || p.unsigned_area() >= min_area)
            .map(|(_, p)| p.clone())
            .collect(),
    )
}

/// Shrinks (negative distance) or grows a polygon.
pub fn buffer(mp: &MultiPolygon, distance: f64) -> MultiPolygon {
    if mp.0.is_empty() || distance == 0.0 {
        return mp.clone();
    }
    geo_buffer::buffer_multi_polygon(mp, distance)
}

pub fn centroid(mp: &MultiPolygon) -> Option<Coord> {
    mp.centroid().map(|p| p.0)
}

/// A point guaranteed to lie inside the polygon: the centroid when it does,
/// otherwise the interior point of the largest part.
pub fn representative_point(mp: &MultiPolygon) -> Option<Point> {
    if let Some(c) = mp.centroid() {
        if mp.contains(&c) {
            return Some(c);
        }
    }
    mp.0.iter()
        .max_by(|a, b| a.unsigned_area().total_cmp(&b.unsigned_area()))?
        .interior_point()
}

/// Cuts `polygon` with `cut` into two non-empty parts, smallest first.
/// `None` if the line does not divide the polygon.
pub fn split_polygon(polygon: &MultiPolygon, cut: &LineString) -> Option<(MultiPolygon, MultiPolygon)> {
    let rect = polygon.bounding_rect()?;
    let (first, last) = super::endpoints(cut)?;
    let reach = 2.0 * distance(rect.min(), rect.max()) + 1.0;

    let extend = |from: Coord, to: Coord| -> Coord {
        let len = distance(from, to);
        if len == 0.0 {
            return to;
        }
        Coord {
            x: to.x + (to.x - from.x) / len * reach,
            y: to.y + (to.y - from.y) / len * reach,
        }
    };
    let coords = &cut.0;
    let head = extend(coords[1], first);
    let tail = extend(coords[coords.len() - 2], last);

    // strip on the left of the overall cut direction
    let dir_len = distance(head, tail);
    if dir_len == 0.0 {
        return None;
    }
    let nx = -(tail.y - head.y) / dir_len * reach;
    let ny = (tail.x - head.x) / dir_len * reach;
    let mut ring: Vec<Coord> = Vec::with_capacity(coords.len() + 5);
    ring.push(head);
    ring.extend(coords.iter().copied());
    ring.push(tail);
    ring.push(Coord { x: tail.x + nx, y: tail.y + ny });
    ring.push(Coord { x: head.x + nx, y: head.y + ny });
    ring.push(head);
    let left = MultiPolygon::new(vec![Polygon::new(LineString::new(ring), vec![])]);

    let a = intersection(polygon, &left);
    let b = difference(polygon, &left);
    if is_empty(&a) || is_empty(&b) {
        return None;
    }
    if area(&a) <= area(&b) { Some((a, b)) } else { Some((b, a)) }
}
