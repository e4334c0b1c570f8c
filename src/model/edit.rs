//! Structural edits on a model. Each edit keeps link geometry attached to
//! the node geometry.

use super::node::META_STREEFPEIL;
use super::tables::{
    FlowBoundaryStatic, LevelBoundaryStatic, LinearResistanceStatic, ManningResistanceStatic,
    StructureStatic, TabulatedRatingCurveStatic,
};
use super::{BasinArea, Link, LinkId, LinkType, Meta, Model, NodeId, NodeType};
use crate::error::{Error, Result};
use crate::geometry::{self, Coord, LineString, MultiPolygon, Point, polygon};
use crate::report::Stage;
use geo::{Contains, Intersects};
use tracing::{debug, info};

/// Capacity given to connectors that have no parametrised flow rate yet.
pub const DEFAULT_CONNECTOR_FLOW_RATE: f64 = 100.0;
pub const DEFAULT_MANNING_N: f64 = 0.04;
pub const DEFAULT_PROFILE_WIDTH: f64 = 25.0;
pub const DEFAULT_PROFILE_SLOPE: f64 = 1.0;
pub const DEFAULT_LINEAR_RESISTANCE: f64 = 0.005;

fn missing(node_id: NodeId, invariant: &str) -> Error {
    Error::topology(Stage::Edit, vec![node_id], invariant)
}

impl Model {
    fn require_type(&self, node_id: NodeId, node_type: NodeType) -> Result<&super::Node> {
        let node = self.require_node(node_id, Stage::Edit)?;
        if node.node_type != node_type {
            return Err(missing(node_id, &format!("node is a {node_type}")));
        }
        Ok(node)
    }

    /// Removes a link; unknown ids are an error.
    pub fn remove_link_checked(&mut self, link_id: LinkId) -> Result<Link> {
        self.links
            .remove(&link_id)
            .ok_or_else(|| Error::topology(Stage::Edit, vec![link_id], "link exists"))
    }

    pub fn remove_node_checked(&mut self, node_id: NodeId) -> Result<()> {
        self.remove_node(node_id)
            .map(|_| ())
            .ok_or_else(|| missing(node_id, "node exists"))
    }

    /// Adds a basin at `geometry`, or inside `area` when no point is given.
    pub fn add_basin(
        &mut self,
        geometry: Option<Point>,
        area: Option<MultiPolygon>,
        meta: Meta,
    ) -> Result<NodeId> {
        let point = match (&geometry, &area) {
            (Some(p), _) => *p,
            (None, Some(mp)) => polygon::representative_point(mp)
                .ok_or_else(|| Error::Geometry {
                    stage: Stage::Edit,
                    entity: "add_basin".to_string(),
                    message: "basin area has no interior point".to_string(),
                })?,
            (None, None) => {
                return Err(Error::Geometry {
                    stage: Stage::Edit,
                    entity: "add_basin".to_string(),
                    message: "needs a point or an area".to_string(),
                });
            }
        };
        let node_id = self.add_node(NodeType::Basin, point);
        if let Some(node) = self.node_mut(node_id) {
            node.meta = meta.clone();
        }
        if let Some(mp) = area {
            let mut basin_area = BasinArea::new(node_id, mp);
            if let Some(level) = meta.get(META_STREEFPEIL) {
                basin_area
                    .meta
                    .insert(META_STREEFPEIL.to_string(), level.clone());
            }
            self.basin_areas.push(basin_area);
        }
        Ok(node_id)
    }

    /// Adds `geometry` to the area of basin `node_id`, unioning with any
    /// polygon it already owns.
    pub fn add_basin_area(&mut self, node_id: NodeId, geometry: MultiPolygon, meta: Meta) -> Result<()> {
        self.require_type(node_id, NodeType::Basin)?;
        match self.basin_area_mut(node_id) {
            Some(existing) => {
                existing.geometry = polygon::union(&existing.geometry, &geometry);
                existing.meta.extend(meta);
            }
            None => {
                let mut area = BasinArea::new(node_id, geometry);
                area.meta = meta;
                self.basin_areas.push(area);
            }
        }
        Ok(())
    }

    pub fn update_basin_area(&mut self, node_id: NodeId, geometry: MultiPolygon, meta: Meta) -> Result<()> {
        self.require_type(node_id, NodeType::Basin)?;
        self.basin_areas.retain(|a| a.node_id != node_id);
        let mut area = BasinArea::new(node_id, geometry);
        area.meta = meta;
        self.basin_areas.push(area);
        Ok(())
    }

    pub fn remove_basin_area(&mut self, node_id: NodeId) -> Result<()> {
        let before = self.basin_areas.len();
        self.basin_areas.retain(|a| a.node_id != node_id);
        if before == self.basin_areas.len() {
            return Err(missing(node_id, "basin has an area"));
        }
        Ok(())
    }

    pub fn reverse_link(&mut self, link_id: LinkId) -> Result<()> {
        let link = self
            .links
            .get_mut(&link_id)
            .ok_or_else(|| Error::topology(Stage::Edit, vec![link_id], "link exists"))?;
        std::mem::swap(&mut link.from_node_id, &mut link.to_node_id);
        link.geometry = geometry::reversed(&link.geometry);
        Ok(())
    }

    /// Points either end of a link at another node.
    pub fn redirect_link(
        &mut self,
        link_id: LinkId,
        from_node_id: Option<NodeId>,
        to_node_id: Option<NodeId>,
    ) -> Result<()> {
        let link = self
            .links
            .get(&link_id)
            .ok_or_else(|| Error::topology(Stage::Edit, vec![link_id], "link exists"))?;
        let from = from_node_id.unwrap_or(link.from_node_id);
        let to = to_node_id.unwrap_or(link.to_node_id);
        let a = self.require_node(from, Stage::Edit)?.geometry.0;
        let b = self.require_node(to, Stage::Edit)?.geometry.0;
        if let Some(link) = self.links.get_mut(&link_id) {
            link.from_node_id = from;
            link.to_node_id = to;
            link.geometry = geometry::snap_line_ends(&link.geometry, a, b);
        }
        Ok(())
    }

    /// Changes the type of a node, replacing its rows with defaults for the
    /// new type. A TabulatedRatingCurve turned into an Outlet keeps its
    /// largest flow rate.
    pub fn update_node(&mut self, node_id: NodeId, node_type: NodeType) -> Result<()> {
        let old_type = self.require_node(node_id, Stage::Edit)?.node_type;
        if old_type == node_type {
            return Ok(());
        }
        let kept_flow_rate = match old_type {
            NodeType::TabulatedRatingCurve => self
                .tables
                .tabulated_rating_curve_static
                .iter()
                .filter(|r| r.node_id == node_id)
                .map(|r| r.flow_rate)
                .reduce(f64::max),
            NodeType::Pump | NodeType::Outlet => self
                .tables
                .structure_static(old_type)
                .and_then(|rows| {
                    rows.iter()
                        .filter(|r| r.node_id == node_id)
                        .map(|r| r.flow_rate)
                        .reduce(f64::max)
                }),
            _ => None,
        };
        self.tables.remove_node(node_id);
        if let Some(node) = self.node_mut(node_id) {
            node.node_type = node_type;
        }
        self.add_default_rows(node_id, node_type, kept_flow_rate);
        info!(node_id, from = %old_type, to = %node_type, "Retyped node");
        Ok(())
    }

    /// Static rows for a node that has none yet.
    pub fn add_default_rows(&mut self, node_id: NodeId, node_type: NodeType, flow_rate: Option<f64>) {
        let tables = &mut self.tables;
        match node_type {
            NodeType::Pump | NodeType::Outlet => {
                let row = StructureStatic::new(node_id, flow_rate.unwrap_or(DEFAULT_CONNECTOR_FLOW_RATE));
                if let Some(rows) = tables.structure_static_mut(node_type) {
                    rows.push(row);
                }
            }
            NodeType::ManningResistance => {
                let length = self
                    .links
                    .values()
                    .filter(|l| l.touches(node_id) && l.link_type == LinkType::Flow)
                    .map(|l| l.length())
                    .sum::<f64>();
                let length = ((length / 10.0).round() * 10.0).max(10.0);
                tables.manning_resistance_static.push(ManningResistanceStatic {
                    node_id,
                    active: None,
                    control_state: None,
                    length,
                    manning_n: DEFAULT_MANNING_N,
                    profile_width: DEFAULT_PROFILE_WIDTH,
                    profile_slope: DEFAULT_PROFILE_SLOPE,
                });
            }
            NodeType::LinearResistance => {
                tables.linear_resistance_static.push(LinearResistanceStatic {
                    node_id,
                    active: None,
                    control_state: None,
                    resistance: DEFAULT_LINEAR_RESISTANCE,
                    max_flow_rate: flow_rate,
                })
            }
            NodeType::TabulatedRatingCurve => {
                let q = flow_rate.unwrap_or(DEFAULT_CONNECTOR_FLOW_RATE);
                for (level, flow_rate) in [(0.0, 0.0), (1.0, q)] {
                    tables
                        .tabulated_rating_curve_static
                        .push(TabulatedRatingCurveStatic {
                            node_id,
                            active: None,
                            control_state: None,
                            level,
                            flow_rate,
                        });
                }
            }
            NodeType::LevelBoundary => tables.level_boundary_static.push(LevelBoundaryStatic {
                node_id,
                active: None,
                level: 0.0,
            }),
            NodeType::FlowBoundary => tables.flow_boundary_static.push(FlowBoundaryStatic {
                node_id,
                active: None,
                flow_rate: flow_rate.unwrap_or(0.0),
            }),
            _ => {}
        }
    }

    /// Marks every static row of a connector or boundary inactive.
    pub fn deactivate_node(&mut self, node_id: NodeId) -> Result<()> {
        let node_type = self.require_node(node_id, Stage::Edit)?.node_type;
        let t = &mut self.tables;
        let mut touched = 0usize;
        macro_rules! deactivate {
            ($rows:expr) => {
                for row in $rows.iter_mut().filter(|r| r.node_id == node_id) {
                    row.active = Some(false);
                    touched += 1;
                }
            };
        }
        match node_type {
            NodeType::Pump => deactivate!(t.pump_static),
            NodeType::Outlet => deactivate!(t.outlet_static),
            NodeType::ManningResistance => deactivate!(t.manning_resistance_static),
            NodeType::LinearResistance => deactivate!(t.linear_resistance_static),
            NodeType::TabulatedRatingCurve => deactivate!(t.tabulated_rating_curve_static),
            NodeType::LevelBoundary => deactivate!(t.level_boundary_static),
            NodeType::FlowBoundary => deactivate!(t.flow_boundary_static),
            NodeType::PidControl => deactivate!(t.pid_control_static),
            _ => {}
        }
        if touched == 0 {
            return Err(missing(node_id, "node has static rows with an 'active' column"));
        }
        Ok(())
    }

    /// Connects two basins with a new connector halfway between them.
    pub fn connect_basins(
        &mut self,
        from_basin_id: NodeId,
        to_basin_id: NodeId,
        node_type: NodeType,
    ) -> Result<NodeId> {
        let a = self.require_type(from_basin_id, NodeType::Basin)?.geometry.0;
        let b = self.require_type(to_basin_id, NodeType::Basin)?.geometry.0;
        if !node_type.is_connector() {
            return Err(missing(from_basin_id, "basins are connected through a connector"));
        }
        let mid = Point(Coord {
            x: (a.x + b.x) / 2.0,
            y: (a.y + b.y) / 2.0,
        });
        let connector = self.add_node(node_type, mid);
        self.add_link(from_basin_id, connector, LinkType::Flow)?;
        self.add_link(connector, to_basin_id, LinkType::Flow)?;
        self.add_default_rows(connector, node_type, None);
        Ok(connector)
    }

    /// Merges `basin_id` into `to_basin_id`. With `are_connected` the
    /// connectors that link the two basins directly are removed first.
    pub fn merge_basins(&mut self, basin_id: NodeId, to_basin_id: NodeId, are_connected: bool) -> Result<()> {
        self.require_type(basin_id, NodeType::Basin)?;
        self.require_type(to_basin_id, NodeType::Basin)?;
        if basin_id == to_basin_id {
            return Err(missing(basin_id, "merge_basins needs two distinct basins"));
        }

        if are_connected {
            let between: Vec<NodeId> = self
                .nodes
                .values()
                .filter(|n| n.node_type.is_connector())
                .filter(|n| {
                    let up = self.upstream_node_ids(n.node_id);
                    let down = self.downstream_node_ids(n.node_id);
                    (up.contains(&basin_id) && down.contains(&to_basin_id))
                        || (up.contains(&to_basin_id) && down.contains(&basin_id))
                })
                .map(|n| n.node_id)
                .collect();
            if between.is_empty() {
                return Err(Error::topology(
                    Stage::Edit,
                    vec![basin_id, to_basin_id],
                    "basins are connected through a connector",
                ));
            }
            for connector in between {
                debug!(connector, "Removing connector between merged basins");
                self.remove_node(connector);
            }
        }

        let link_ids: Vec<LinkId> = self
            .links
            .values()
            .filter(|l| l.touches(basin_id))
            .map(|l| l.link_id)
            .collect();
        for link_id in link_ids {
            let Some(link) = self.links.get(&link_id) else {
                continue;
            };
            let from = (link.from_node_id == basin_id).then_some(to_basin_id);
            let to = (link.to_node_id == basin_id).then_some(to_basin_id);
            self.redirect_link(link_id, from, to)?;
        }
        self.links.retain(|_, l| l.from_node_id != l.to_node_id);
        self.tables.rewire_listen_node(basin_id, to_basin_id);

        let merged_area = self
            .basin_areas
            .iter()
            .filter(|a| a.node_id == basin_id)
            .map(|a| a.geometry.clone())
            .reduce(|a, b| polygon::union(&a, &b));
        if let Some(area) = merged_area {
            self.add_basin_area(to_basin_id, area, Meta::new())?;
        }
        self.remove_node(basin_id);
        info!(basin_id, to_basin_id, "Merged basins");
        Ok(())
    }

    /// Splits the area of a basin along `cut`. The part without the basin
    /// node becomes a new basin, joined to the original by a
    /// ManningResistance; flow links of nodes inside the new part follow it.
    pub fn split_basin(&mut self, node_id: Option<NodeId>, cut: &LineString) -> Result<NodeId> {
        let basin_id = match node_id {
            Some(id) => id,
            None => {
                let candidates: Vec<NodeId> = self
                    .basin_areas
                    .iter()
                    .filter(|a| a.geometry.intersects(cut))
                    .map(|a| a.node_id)
                    .collect();
                match candidates.as_slice() {
                    [one] => *one,
                    _ => {
                        return Err(Error::Geometry {
                            stage: Stage::Edit,
                            entity: "split_basin".to_string(),
                            message: format!(
                                "cut line must cross exactly one basin area, crosses {}",
                                candidates.len()
                            ),
                        });
                    }
                }
            }
        };
        let basin = self.require_type(basin_id, NodeType::Basin)?.clone();
        let area = self
            .basin_area(basin_id)
            .ok_or_else(|| missing(basin_id, "basin has an area"))?
            .clone();
        let (small, large) = polygon::split_polygon(&area.geometry, cut).ok_or_else(|| Error::Geometry {
            stage: Stage::Edit,
            entity: format!("basin {basin_id}"),
            message: "cut line does not divide the basin area".to_string(),
        })?;
        let (keep, split_off) = if small.contains(&basin.geometry) {
            (small, large)
        } else {
            (large, small)
        };

        if let Some(existing) = self.basin_area_mut(basin_id) {
            existing.geometry = keep;
        }
        let mut meta = basin.meta.clone();
        meta.remove(super::node::META_CODE);
        let new_basin = self.add_basin(None, Some(split_off.clone()), meta)?;

        let moved: Vec<(LinkId, bool)> = self
            .flow_links()
            .filter(|l| l.touches(basin_id))
            .filter_map(|l| {
                let other = l.other_end(basin_id)?;
                let p = self.node(other)?.geometry;
                split_off
                    .contains(&p)
                    .then_some((l.link_id, l.from_node_id == basin_id))
            })
            .collect();
        for (link_id, basin_is_source) in moved {
            if basin_is_source {
                self.redirect_link(link_id, Some(new_basin), None)?;
            } else {
                self.redirect_link(link_id, None, Some(new_basin))?;
            }
        }
        self.connect_basins(basin_id, new_basin, NodeType::ManningResistance)?;
        info!(basin_id, new_basin, "Split basin");
        Ok(new_basin)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use geo_types::polygon;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1), (x: x0, y: y0)
        ]])
    }

    #[test]
    fn test_reverse_link() {
        let mut model = two_basin_chain();
        model.reverse_link(1).unwrap();
        let link = model.link(1).unwrap();
        assert_eq!((link.from_node_id, link.to_node_id), (2, 1));
        assert_eq!(link.geometry.0[0], Coord { x: 100.0, y: 0.0 });
    }

    #[test]
    fn test_update_node_trc_to_outlet_keeps_flow_rate() {
        let mut model = two_basin_chain();
        model.update_node(2, NodeType::TabulatedRatingCurve).unwrap();
        model.tables.tabulated_rating_curve_static[1].flow_rate = 4.2;
        model.update_node(2, NodeType::Outlet).unwrap();
        assert!(model.tables.tabulated_rating_curve_static.is_empty());
        assert_eq!(model.tables.outlet_static.len(), 1);
        assert_eq!(model.tables.outlet_static[0].flow_rate, 4.2);
    }

    #[test]
    fn test_merge_connected_basins() {
        let mut model = two_basin_chain();
        model.basin_areas.push(BasinArea::new(1, rect(-50.0, -50.0, 50.0, 50.0)));
        model.basin_areas.push(BasinArea::new(3, rect(150.0, -50.0, 250.0, 50.0)));
        model.merge_basins(1, 3, true).unwrap();
        assert!(model.node(1).is_none());
        assert!(model.node(2).is_none());
        assert!(model.links.is_empty());
        assert!((model.basin_area_m2(3) - 20000.0).abs() < 1e-6);
    }

    #[test]
    fn test_merge_unconnected_requires_flag() {
        let mut model = two_basin_chain();
        let b = model.add_node(NodeType::Basin, pt(500.0, 0.0));
        assert!(model.merge_basins(b, 3, true).is_err());
        model.merge_basins(b, 3, false).unwrap();
        assert!(model.node(b).is_none());
    }

    #[test]
    fn test_connect_and_deactivate() {
        let mut model = two_basin_chain();
        let c = model.connect_basins(3, 1, NodeType::Outlet).unwrap();
        assert_eq!(model.upstream_node_ids(c), vec![3]);
        model.deactivate_node(c).unwrap();
        assert_eq!(model.tables.outlet_static[0].active, Some(false));
        assert!(model.deactivate_node(1).is_err());
    }

    #[test]
    fn test_split_basin_moves_links() {
        let mut model = two_basin_chain();
        // basin 3 at (200, 0), area spans x 150..350; pump 2 upstream at x=100
        model.basin_areas.push(BasinArea::new(3, rect(150.0, -50.0, 350.0, 50.0)));
        let outlet = model.add_node(NodeType::Outlet, pt(320.0, 0.0));
        model.add_link(3, outlet, LinkType::Flow).unwrap();
        let cut = LineString::new(vec![Coord { x: 300.0, y: -100.0 }, Coord { x: 300.0, y: 100.0 }]);
        let new_basin = model.split_basin(None, &cut).unwrap();
        assert_eq!(model.upstream_node_ids(outlet), vec![new_basin]);
        assert!((model.basin_area_m2(3) - 15000.0).abs() < 1e-6);
        assert!((model.basin_area_m2(new_basin) - 5000.0).abs() < 1e-6);
        assert_eq!(model.nodes_of_type(NodeType::ManningResistance).count(), 1);
    }
}
