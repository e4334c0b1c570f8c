//! Planar geometry kernel. All coordinates are metres in a projected CRS.

pub mod index;
pub mod polygon;

pub use geo_types::{Coord, Geometry, LineString, MultiLineString, MultiPolygon, Point, Polygon};

/// Relative tolerance (fraction of the line length) for `split`.
pub const SPLIT_EPSILON: f64 = 1e-8;

// --- Points ---

#[inline]
pub fn distance(a: Coord, b: Coord) -> f64 {
    (a.x - b.x).hypot(a.y - b.y)
}

#[inline]
pub fn is_finite(c: Coord) -> bool {
    c.x.is_finite() && c.y.is_finite()
}

/// Element of `items` closest to `point`. Ties resolve to the earliest item.
pub fn nearest<T>(point: Coord, items: impl IntoIterator<Item = (T, Coord)>) -> Option<T> {
    let mut best: Option<(T, f64)> = None;
    for (item, c) in items {
        let d = distance(point, c);
        if best.as_ref().is_none_or(|(_, best_d)| d < *best_d) {
            best = Some((item, d));
        }
    }
    best.map(|(item, _)| item)
}

/// Point at `distance` metres to the left of the direction `from -> to`,
/// measured from `to`. Degenerate directions offset towards +y.
pub fn offset_left(from: Coord, to: Coord, distance: f64) -> Coord {
    let dx = to.x - from.x;
    let dy = to.y - from.y;
    let len = dx.hypot(dy);
    if len == 0.0 || !len.is_finite() {
        return Coord {
            x: to.x,
            y: to.y + distance,
        };
    }
    Coord {
        x: to.x - dy / len * distance,
        y: to.y + dx / len * distance,
    }
}

// --- Metric Geometry Functions (XY Space) ---

/// Euclidean length of a polyline.
pub fn line_length(line: &LineString) -> f64 {
    line.0.windows(2).map(|w| distance(w[0], w[1])).sum()
}

pub fn straight_line(a: Coord, b: Coord) -> LineString {
    LineString::new(vec![a, b])
}

pub fn endpoints(line: &LineString) -> Option<(Coord, Coord)> {
    match (line.0.first(), line.0.last()) {
        (Some(a), Some(b)) if line.0.len() >= 2 => Some((*a, *b)),
        _ => None,
    }
}

/// Foot point of a projection onto a polyline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    /// Arc length from the start of the line to the foot point.
    pub s: f64,
    /// Distance between the projected point and the foot point.
    pub distance: f64,
    pub point: Coord,
}

/// Projects `point` onto `line`. The first of equally close segments wins.
pub fn project_onto(line: &LineString, point: Coord) -> Option<Projection> {
    let coords = &line.0;
    match coords.len() {
        0 => return None,
        1 => {
            return Some(Projection {
                s: 0.0,
                distance: distance(point, coords[0]),
                point: coords[0],
            });
        }
        _ => {}
    }

    let mut best: Option<Projection> = None;
    let mut walked = 0.0;
    for w in coords.windows(2) {
        let (a, b) = (w[0], w[1]);
        let dx = b.x - a.x;
        let dy = b.y - a.y;
        let len2 = dx * dx + dy * dy;
        let seg_len = len2.sqrt();
        let t = if len2 > 0.0 {
            (((point.x - a.x) * dx + (point.y - a.y) * dy) / len2).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let foot = Coord {
            x: a.x + t * dx,
            y: a.y + t * dy,
        };
        let d = distance(point, foot);
        if best.is_none_or(|p| d < p.distance) {
            best = Some(Projection {
                s: walked + t * seg_len,
                distance: d,
                point: foot,
            });
        }
        walked += seg_len;
    }
    best
}

/// Arc length `s` of the foot point of `point` on `line`.
pub fn project(line: &LineString, point: Coord) -> f64 {
    project_onto(line, point).map(|p| p.s).unwrap_or(0.0)
}

pub fn point_line_distance(point: Coord, line: &LineString) -> f64 {
    project_onto(line, point)
        .map(|p| p.distance)
        .unwrap_or(f64::INFINITY)
}

/// Point at arc length `s` along `line`, clamped to the line.
pub fn interpolate(line: &LineString, s: f64) -> Option<Coord> {
    let coords = &line.0;
    let first = *coords.first()?;
    if s <= 0.0 {
        return Some(first);
    }
    let mut walked = 0.0;
    for w in coords.windows(2) {
        let seg_len = distance(w[0], w[1]);
        if walked + seg_len >= s && seg_len > 0.0 {
            let t = (s - walked) / seg_len;
            return Some(Coord {
                x: w[0].x + t * (w[1].x - w[0].x),
                y: w[0].y + t * (w[1].y - w[0].y),
            });
        }
        walked += seg_len;
    }
    coords.last().copied()
}

/// Part of `line` between arc lengths `s0 <= s1`.
pub fn substring(line: &LineString, s0: f64, s1: f64) -> LineString {
    let (s0, s1) = if s0 <= s1 { (s0, s1) } else { (s1, s0) };
    let mut out: Vec<Coord> = Vec::new();
    let Some(start) = interpolate(line, s0) else {
        return LineString::new(out);
    };
    out.push(start);

    let mut walked = 0.0;
    for w in line.0.windows(2) {
        walked += distance(w[0], w[1]);
        if walked > s0 && walked < s1 {
            out.push(w[1]);
        }
    }
    if let Some(end) = interpolate(line, s1) {
        out.push(end);
    }
    out.dedup();
    LineString::new(out)
}

/// Splits `line` at `point`.
///
/// Returns `(line, empty)` when the point is farther than `SPLIT_EPSILON`
/// times the line length from the line, or when it projects onto an endpoint.
pub fn split(line: &LineString, point: Coord) -> (LineString, LineString) {
    let length = line_length(line);
    let empty = LineString::new(vec![]);
    let Some(proj) = project_onto(line, point) else {
        return (line.clone(), empty);
    };
    if proj.distance > SPLIT_EPSILON * length || proj.s <= 0.0 || proj.s >= length {
        return (line.clone(), empty);
    }
    (substring(line, 0.0, proj.s), substring(line, proj.s, length))
}

/// Drops non-finite and consecutive duplicate coordinates. `None` if fewer
/// than two distinct coordinates remain.
pub fn repair_linestring(line: &LineString) -> Option<LineString> {
    let mut coords: Vec<Coord> = line.0.iter().copied().filter(|c| is_finite(*c)).collect();
    coords.dedup();
    if coords.len() < 2 {
        return None;
    }
    Some(LineString::new(coords))
}

/// Replaces the end vertices of `line` with `start` and `end`.
pub fn snap_line_ends(line: &LineString, start: Coord, end: Coord) -> LineString {
    let mut coords = line.0.clone();
    if coords.len() < 2 {
        return straight_line(start, end);
    }
    coords[0] = start;
    let last = coords.len() - 1;
    coords[last] = end;
    coords.dedup();
    if coords.len() < 2 {
        return straight_line(start, end);
    }
    LineString::new(coords)
}

/// Concatenates polylines, dropping repeated junction vertices.
pub fn join_lines<'a>(parts: impl IntoIterator<Item = &'a LineString>) -> LineString {
    let mut coords: Vec<Coord> = Vec::new();
    for part in parts {
        for c in &part.0 {
            if coords.last() != Some(c) {
                coords.push(*c);
            }
        }
    }
    LineString::new(coords)
}

pub fn reversed(line: &LineString) -> LineString {
    LineString::new(line.0.iter().rev().copied().collect())
}

/// Flattens (multi)linestrings into single linestrings.
pub fn explode_lines(geometry: &Geometry) -> Vec<LineString> {
    match geometry {
        Geometry::LineString(ls) => vec![ls.clone()],
        Geometry::MultiLineString(mls) => mls.0.clone(),
        Geometry::GeometryCollection(gc) => gc.0.iter().flat_map(explode_lines).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(x: f64, y: f64) -> Coord {
        Coord { x, y }
    }

    fn l_shape() -> LineString {
        LineString::new(vec![c(0.0, 0.0), c(10.0, 0.0), c(10.0, 10.0)])
    }

    #[test]
    fn test_line_length() {
        assert!((line_length(&l_shape()) - 20.0).abs() < 1e-12);
    }

    #[test]
    fn test_project_and_interpolate() {
        let line = l_shape();
        let s = project(&line, c(12.0, 5.0));
        assert!((s - 15.0).abs() < 1e-9);
        let p = interpolate(&line, 15.0).unwrap();
        assert!(distance(p, c(10.0, 5.0)) < 1e-9);
        assert_eq!(interpolate(&line, 100.0), Some(c(10.0, 10.0)));
        assert_eq!(interpolate(&line, -1.0), Some(c(0.0, 0.0)));
    }

    #[test]
    fn test_split_on_line() {
        let (a, b) = split(&l_shape(), c(10.0, 2.0));
        assert!((line_length(&a) - 12.0).abs() < 1e-9);
        assert!((line_length(&b) - 8.0).abs() < 1e-9);
        assert_eq!(a.0.last(), b.0.first());
    }

    #[test]
    fn test_split_off_line_returns_empty_part() {
        let (a, b) = split(&l_shape(), c(5.0, 5.0));
        assert_eq!(a, l_shape());
        assert!(b.0.is_empty());
    }

    #[test]
    fn test_substring_keeps_interior_vertices() {
        let sub = substring(&l_shape(), 5.0, 15.0);
        assert_eq!(sub.0, vec![c(5.0, 0.0), c(10.0, 0.0), c(10.0, 5.0)]);
    }

    #[test]
    fn test_nearest_ties_by_insertion_order() {
        let items = vec![(1, c(1.0, 0.0)), (2, c(-1.0, 0.0)), (3, c(5.0, 0.0))];
        assert_eq!(nearest(c(0.0, 0.0), items), Some(1));
        assert_eq!(nearest::<i32>(c(0.0, 0.0), vec![]), None);
    }

    #[test]
    fn test_repair_linestring() {
        let line = LineString::new(vec![c(0.0, 0.0), c(0.0, 0.0), c(f64::NAN, 1.0), c(1.0, 1.0)]);
        assert_eq!(repair_linestring(&line).unwrap().0, vec![c(0.0, 0.0), c(1.0, 1.0)]);
        let degenerate = LineString::new(vec![c(2.0, 2.0), c(2.0, 2.0)]);
        assert!(repair_linestring(&degenerate).is_none());
    }

    #[test]
    fn test_offset_left() {
        let p = offset_left(c(0.0, 0.0), c(10.0, 0.0), 10.0);
        assert!(distance(p, c(10.0, 10.0)) < 1e-9);
    }
}
