//! Link geometry between authorities, routed over the backbone network.

use super::CouplingConfig;
use crate::geometry::{self, Coord, LineString, MultiPolygon};
use crate::network::Network;
use geo::Intersects;
use tracing::debug;

/// Own coverage shrunk by the tolerance, so routes may skim its edge.
pub fn shrink_mask(coverage: &MultiPolygon, tolerance: f64) -> MultiPolygon {
    geometry::polygon::buffer(coverage, -tolerance)
}

/// Route from `from` to `to` over the backbone. The route starts on one of
/// the backbone links nearest `from`, tried in order of distance, and ends
/// at the backbone node nearest `to`. Routes entering `mask` are rejected.
/// The returned line runs from `from` to `to`; `None` when no candidate
/// link yields an acceptable route.
pub fn route(
    backbone: &mut Network,
    from: Coord,
    to: Coord,
    mask: &MultiPolygon,
    config: &CouplingConfig,
) -> Option<LineString> {
    let (target, _) = backbone.nearest_node(to)?;
    for (link_id, distance) in backbone.links_by_distance(from, config.max_candidate_links) {
        let Some(source) = backbone.snap_to_link(link_id, from, config.align_distance, config.max_snap_distance)
        else {
            continue;
        };
        let Some(path) = backbone.shortest_path(source, target) else {
            debug!(link_id, "No backbone path from candidate link");
            continue;
        };
        let mut coords = vec![from];
        coords.extend(backbone.path_geometry(&path).0);
        coords.push(to);
        coords.dedup();
        let line = LineString::new(coords);
        if !mask.0.is_empty() && mask.intersects(&line) {
            debug!(link_id, distance, "Backbone route crosses own coverage");
            continue;
        }
        return Some(line);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{InputLine, NetworkConfig};
    use crate::report::Report;
    use geo_types::{line_string, polygon};

    fn c(x: f64, y: f64) -> Coord {
        Coord { x, y }
    }

    #[test]
    fn test_route_follows_backbone() {
        let mut backbone = Network::from_lines(
            vec![
                InputLine::new(line_string![(x: 0.0, y: 50.0), (x: 500.0, y: 50.0)]),
                InputLine::new(line_string![(x: 500.0, y: 50.0), (x: 500.0, y: 0.0)]),
            ],
            &NetworkConfig::default(),
            &mut Report::new(),
        )
        .unwrap();
        let line = route(
            &mut backbone,
            c(100.0, 45.0),
            c(510.0, 0.0),
            &MultiPolygon::new(vec![]),
            &CouplingConfig::default(),
        )
        .unwrap();
        assert_eq!(line.0.first().copied(), Some(c(100.0, 45.0)));
        assert_eq!(line.0.last().copied(), Some(c(510.0, 0.0)));
        assert!(line.0.contains(&c(500.0, 50.0)));
    }

    #[test]
    fn test_route_rejected_by_mask() {
        let mut backbone = Network::from_lines(
            vec![InputLine::new(line_string![(x: 0.0, y: 0.0), (x: 1000.0, y: 0.0)])],
            &NetworkConfig::default(),
            &mut Report::new(),
        )
        .unwrap();
        let coverage = MultiPolygon::new(vec![polygon![
            (x: 300.0, y: -100.0), (x: 600.0, y: -100.0), (x: 600.0, y: 100.0), (x: 300.0, y: 100.0),
        ]]);
        let mask = shrink_mask(&coverage, 25.0);
        let config = CouplingConfig::default();
        assert!(route(&mut backbone, c(0.0, 5.0), c(1000.0, 0.0), &mask, &config).is_none());
        assert!(route(&mut backbone, c(0.0, 5.0), c(200.0, 0.0), &mask, &config).is_some());
    }
}
