//! R-tree indices over points and bounding boxes. Query results are returned
//! in ascending item order so downstream processing stays deterministic.

use super::{Coord, LineString, MultiPolygon};
use geo::BoundingRect;
use geo_types::Rect;
use rstar::{AABB, PointDistance, RTree, RTreeObject};

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedPoint<T> {
    pub item: T,
    pub coord: [f64; 2],
}

impl<T> RTreeObject for IndexedPoint<T> {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.coord)
    }
}

impl<T> PointDistance for IndexedPoint<T> {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.coord[0] - point[0];
        let dy = self.coord[1] - point[1];
        dx * dx + dy * dy
    }
}

pub struct PointIndex<T> {
    tree: RTree<IndexedPoint<T>>,
}

impl<T: Copy + Ord> PointIndex<T> {
    pub fn new(items: impl IntoIterator<Item = (T, Coord)>) -> Self {
        let points: Vec<IndexedPoint<T>> = items
            .into_iter()
            .map(|(item, c)| IndexedPoint {
                item,
                coord: [c.x, c.y],
            })
            .collect();
        Self {
            tree: RTree::bulk_load(points),
        }
    }

    pub fn insert(&mut self, item: T, c: Coord) {
        self.tree.insert(IndexedPoint {
            item,
            coord: [c.x, c.y],
        });
    }

    pub fn remove(&mut self, item: T, c: Coord) {
        let target = [c.x, c.y];
        let found = self
            .tree
            .locate_all_at_point(&target)
            .find(|p| p.item == item)
            .map(|p| IndexedPoint {
                item: p.item,
                coord: p.coord,
            });
        if let Some(p) = found {
            self.tree.remove(&p);
        }
    }

    /// Items within `radius` of `c` (inclusive).
    pub fn within(&self, c: Coord, radius: f64) -> Vec<T> {
        // rstar takes the squared radius
        let mut out: Vec<T> = self
            .tree
            .locate_within_distance([c.x, c.y], radius * radius)
            .map(|p| p.item)
            .collect();
        out.sort();
        out
    }

    /// Nearest item and its distance; equal distances resolve to the smallest item.
    pub fn nearest(&self, c: Coord) -> Option<(T, f64)> {
        let mut iter = self.tree.nearest_neighbor_iter_with_distance_2(&[c.x, c.y]);
        let (first, best_d2) = iter.next()?;
        let mut best = first.item;
        for (p, d2) in iter {
            if d2 > best_d2 {
                break;
            }
            best = best.min(p.item);
        }
        Some((best, best_d2.sqrt()))
    }

    /// Items inside `rect` grown by `pad`, ascending.
    pub fn in_rect(&self, rect: Rect, pad: f64) -> Vec<T> {
        let mut out: Vec<T> = self
            .tree
            .locate_in_envelope(&aabb(rect, pad))
            .map(|p| p.item)
            .collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedEnvelope<T> {
    pub item: T,
    envelope: AABB<[f64; 2]>,
}

impl<T> RTreeObject for IndexedEnvelope<T> {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

fn aabb(rect: Rect, pad: f64) -> AABB<[f64; 2]> {
    AABB::from_corners(
        [rect.min().x - pad, rect.min().y - pad],
        [rect.max().x + pad, rect.max().y + pad],
    )
}

/// Bounding-box index for polygons and lines; exact predicates are left to
/// the caller.
pub struct EnvelopeIndex<T> {
    tree: RTree<IndexedEnvelope<T>>,
}

impl<T: Copy + Ord> EnvelopeIndex<T> {
    pub fn new(items: impl IntoIterator<Item = (T, Rect)>) -> Self {
        let envelopes: Vec<IndexedEnvelope<T>> = items
            .into_iter()
            .map(|(item, rect)| IndexedEnvelope {
                item,
                envelope: aabb(rect, 0.0),
            })
            .collect();
        Self {
            tree: RTree::bulk_load(envelopes),
        }
    }

    pub fn from_polygons<'a>(items: impl IntoIterator<Item = (T, &'a MultiPolygon)>) -> Self {
        Self::new(
            items
                .into_iter()
                .filter_map(|(item, mp)| mp.bounding_rect().map(|r| (item, r))),
        )
    }

    pub fn from_lines<'a>(items: impl IntoIterator<Item = (T, &'a LineString)>) -> Self {
        Self::new(
            items
                .into_iter()
                .filter_map(|(item, ls)| ls.bounding_rect().map(|r| (item, r))),
        )
    }

    pub fn insert(&mut self, item: T, rect: Rect) {
        self.tree.insert(IndexedEnvelope {
            item,
            envelope: aabb(rect, 0.0),
        });
    }

    /// Items whose envelope intersects `rect` grown by `pad`.
    pub fn intersecting(&self, rect: Rect, pad: f64) -> Vec<T> {
        let mut out: Vec<T> = self
            .tree
            .locate_in_envelope_intersecting(&aabb(rect, pad))
            .map(|e| e.item)
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn near_point(&self, c: Coord, pad: f64) -> Vec<T> {
        self.intersecting(Rect::new(c, c), pad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(x: f64, y: f64) -> Coord {
        Coord { x, y }
    }

    #[test]
    fn test_within_uses_true_radius() {
        let index = PointIndex::new(vec![(1, c(0.0, 0.0)), (2, c(3.0, 4.0)), (3, c(10.0, 0.0))]);
        assert_eq!(index.within(c(0.0, 0.0), 5.0), vec![1, 2]);
        assert_eq!(index.within(c(0.0, 0.0), 4.9), vec![1]);
    }

    #[test]
    fn test_nearest_tie_prefers_smallest_item() {
        let mut index = PointIndex::new(vec![(7, c(1.0, 0.0)), (3, c(-1.0, 0.0))]);
        assert_eq!(index.nearest(c(0.0, 0.0)), Some((3, 1.0)));
        index.remove(3, c(-1.0, 0.0));
        assert_eq!(index.nearest(c(0.0, 0.0)).map(|(i, _)| i), Some(7));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_envelope_query() {
        let lines = [
            LineString::new(vec![c(0.0, 0.0), c(10.0, 0.0)]),
            LineString::new(vec![c(100.0, 100.0), c(110.0, 100.0)]),
        ];
        let index = EnvelopeIndex::from_lines(lines.iter().enumerate());
        assert_eq!(index.near_point(c(5.0, 3.0), 5.0), vec![0]);
        assert!(index.near_point(c(50.0, 50.0), 5.0).is_empty());
    }
}
