//! Prefix reindexing and concatenation of per-authority models.
//!
//! Node and link ids of an authority are shifted to
//! `prefix * 10^digits + id`, which keeps ids of different authorities
//! apart as long as every id has fewer than `digits` digits.

use crate::error::{Error, Result};
use crate::model::node::{META_AUTHORITY, META_LINK_ID_ORIGINAL, META_NODE_ID_ORIGINAL};
use crate::model::{LinkId, MetaValue, Model, NodeId};
use crate::persistence::snap_link_geometries;
use crate::report::Stage;
use crate::validation::{self, Scope};
use ahash::AHashMap;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct ConcatConfig {
    /// Digits reserved for the authority's own ids; derived from the
    /// largest id when `None`.
    pub digits: Option<u32>,
}

/// One model to concatenate.
#[derive(Debug, Clone)]
pub struct ConcatPart {
    pub authority: String,
    pub prefix: i64,
    pub model: Model,
}

pub fn digit_count(mut n: i64) -> u32 {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

fn max_id(model: &Model) -> i64 {
    let node = model.nodes.keys().next_back().copied().unwrap_or(0);
    let link = model.links.keys().next_back().copied().unwrap_or(0);
    node.max(link)
}

/// Shift width: the configured digits or the digit count of the largest
/// id over all parts.
pub fn shift_digits<'a>(models: impl IntoIterator<Item = &'a Model>, config: &ConcatConfig) -> u32 {
    config
        .digits
        .unwrap_or_else(|| digit_count(models.into_iter().map(max_id).max().unwrap_or(0)))
}

/// Renumbers nodes and links through the maps, carrying every reference
/// along. With `keep_original` the old ids are stored in meta.
fn reindex(
    model: Model,
    node_map: &AHashMap<NodeId, NodeId>,
    link_map: &AHashMap<LinkId, LinkId>,
    keep_original: bool,
) -> Model {
    let map_node = |id: NodeId| node_map.get(&id).copied().unwrap_or(id);
    let Model {
        crs,
        starttime,
        endtime,
        solver,
        nodes,
        links,
        mut basin_areas,
        mut tables,
    } = model;

    let nodes = nodes
        .into_values()
        .map(|mut node| {
            if keep_original {
                node.meta
                    .insert(META_NODE_ID_ORIGINAL.to_string(), MetaValue::Integer(node.node_id));
            }
            node.node_id = map_node(node.node_id);
            (node.node_id, node)
        })
        .collect();
    let links = links
        .into_values()
        .map(|mut link| {
            if keep_original {
                link.meta
                    .insert(META_LINK_ID_ORIGINAL.to_string(), MetaValue::Integer(link.link_id));
            }
            link.link_id = link_map.get(&link.link_id).copied().unwrap_or(link.link_id);
            link.from_node_id = map_node(link.from_node_id);
            link.to_node_id = map_node(link.to_node_id);
            (link.link_id, link)
        })
        .collect();
    for area in &mut basin_areas {
        area.node_id = map_node(area.node_id);
    }
    tables.map_node_ids(map_node);

    Model {
        crs,
        starttime,
        endtime,
        solver,
        nodes,
        links,
        basin_areas,
        tables,
    }
}

/// Shifts every node and link id to `prefix * 10^digits + id`. Fails when
/// an id does not fit in `digits`.
pub fn prefix_index(model: Model, prefix: i64, digits: u32) -> Result<Model> {
    let shift = 10_i64
        .checked_pow(digits)
        .and_then(|s| prefix.checked_mul(s))
        .ok_or_else(|| Error::topology(Stage::Concat, vec![prefix], "prefix shift fits in i64"))?;
    let limit = 10_i64.pow(digits);
    let too_large: Vec<i64> = model
        .nodes
        .keys()
        .chain(model.links.keys())
        .copied()
        .filter(|id| *id >= limit || *id < 0)
        .collect();
    if !too_large.is_empty() {
        return Err(Error::topology(
            Stage::Concat,
            too_large,
            format!("ids fit in {digits} digits"),
        ));
    }
    let node_map = model.nodes.keys().map(|id| (*id, shift + id)).collect();
    let link_map = model.links.keys().map(|id| (*id, shift + id)).collect();
    Ok(reindex(model, &node_map, &link_map, false))
}

/// Renumbers nodes and links consecutively from the start values in id
/// order, storing the previous ids in meta. A model already numbered that
/// way is returned unchanged.
pub fn reset_index(model: Model, node_start: NodeId, link_start: LinkId) -> Model {
    let consecutive = |ids: &[i64], start: i64| ids.iter().enumerate().all(|(i, id)| *id == start + i as i64);
    let node_ids: Vec<NodeId> = model.nodes.keys().copied().collect();
    let link_ids: Vec<LinkId> = model.links.keys().copied().collect();
    if consecutive(&node_ids, node_start) && consecutive(&link_ids, link_start) {
        return model;
    }
    let node_map = node_ids
        .into_iter()
        .enumerate()
        .map(|(i, id)| (id, node_start + i as i64))
        .collect();
    let link_map = link_ids
        .into_iter()
        .enumerate()
        .map(|(i, id)| (id, link_start + i as i64))
        .collect();
    reindex(model, &node_map, &link_map, true)
}

/// Concatenates the parts in order into one model. Every part is shifted by
/// its prefix and stamped with its authority; colliding ids or differing
/// CRS abort, and the result must validate.
pub fn concat(parts: Vec<ConcatPart>, config: &ConcatConfig) -> Result<Model> {
    let Some(first) = parts.first() else {
        return Err(Error::EmptyNetwork { stage: Stage::Concat });
    };
    let digits = shift_digits(parts.iter().map(|p| &p.model), config);
    let mut out = Model::new(first.model.crs);
    out.starttime = first.model.starttime;
    out.endtime = first.model.endtime;
    out.solver = first.model.solver.clone();

    for part in parts {
        if part.model.crs != out.crs {
            return Err(Error::topology(
                Stage::Concat,
                vec![part.prefix],
                format!("all parts share {} (got {} for {})", out.crs, part.model.crs, part.authority),
            ));
        }
        let mut model = prefix_index(part.model, part.prefix, digits)?;

        let collisions: Vec<i64> = model
            .nodes
            .keys()
            .filter(|id| out.nodes.contains_key(*id))
            .chain(model.links.keys().filter(|id| out.links.contains_key(*id)))
            .copied()
            .collect();
        if !collisions.is_empty() {
            return Err(Error::topology(Stage::Concat, collisions, "reindexed ids are unique"));
        }

        for node in model.nodes.values_mut() {
            node.meta
                .insert(META_AUTHORITY.to_string(), MetaValue::Text(part.authority.clone()));
        }
        out.nodes.append(&mut model.nodes);
        out.links.append(&mut model.links);
        out.basin_areas.append(&mut model.basin_areas);
        out.tables.append(model.tables);
        info!(authority = %part.authority, prefix = part.prefix, "Concatenated model");
    }
    snap_link_geometries(&mut out);
    out.normalize();
    validation::ensure_valid(&out, Scope::Full, Stage::Concat)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::*;
    use crate::model::tables::DiscreteControlVariable;

    #[test]
    fn test_digit_count() {
        assert_eq!(digit_count(0), 1);
        assert_eq!(digit_count(9), 1);
        assert_eq!(digit_count(10), 2);
        assert_eq!(digit_count(99999), 5);
    }

    #[test]
    fn test_prefix_index_moves_references() {
        let mut model = two_basin_chain();
        model.tables.discrete_control_variable.push(DiscreteControlVariable {
            node_id: 2,
            compound_variable_id: 1,
            listen_node_id: 1,
            variable: "level".to_string(),
            weight: None,
            look_ahead: None,
        });
        let model = prefix_index(model, 7, 3).unwrap();
        assert_eq!(model.nodes.keys().copied().collect::<Vec<_>>(), vec![7001, 7002, 7003]);
        let link = model.link(7001).unwrap();
        assert_eq!((link.from_node_id, link.to_node_id), (7001, 7002));
        assert_eq!(model.tables.pump_static[0].node_id, 7002);
        assert_eq!(model.tables.discrete_control_variable[0].listen_node_id, 7001);
    }

    #[test]
    fn test_prefix_index_rejects_wide_ids() {
        let err = prefix_index(two_basin_chain(), 1, 0).unwrap_err();
        assert!(matches!(err, Error::Topology { stage: Stage::Concat, .. }));
    }

    #[test]
    fn test_reset_index_keeps_original_ids() {
        let model = prefix_index(two_basin_chain(), 3, 2).unwrap();
        let model = reset_index(model, 1, 1);
        assert_eq!(model.nodes.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        let node = model.node(2).unwrap();
        assert_eq!(node.meta.get(META_NODE_ID_ORIGINAL), Some(&MetaValue::Integer(302)));
        assert_eq!(
            model.link(2).unwrap().meta.get(META_LINK_ID_ORIGINAL),
            Some(&MetaValue::Integer(302))
        );

        let again = reset_index(model.clone(), 1, 1);
        assert_eq!(again, model);
    }

    #[test]
    fn test_concat_stamps_authority() {
        let parts = vec![
            ConcatPart { authority: "Rijnland".to_string(), prefix: 13, model: two_basin_chain() },
            ConcatPart { authority: "Delfland".to_string(), prefix: 15, model: two_basin_chain() },
        ];
        let model = concat(parts, &ConcatConfig::default()).unwrap();
        assert_eq!(model.nodes.len(), 6);
        assert_eq!(model.node(131).unwrap().meta_str(META_AUTHORITY), Some("Rijnland"));
        assert_eq!(model.node(153).unwrap().meta_str(META_AUTHORITY), Some("Delfland"));
        assert_eq!(model.authorities(), vec!["Delfland", "Rijnland"]);
    }

    #[test]
    fn test_concat_rejects_collisions() {
        // prefix 1 with one digit: ids 11..13 collide with prefix 1 again
        let parts = vec![
            ConcatPart { authority: "A".to_string(), prefix: 1, model: two_basin_chain() },
            ConcatPart { authority: "B".to_string(), prefix: 1, model: two_basin_chain() },
        ];
        let err = concat(parts, &ConcatConfig { digits: Some(1) }).unwrap_err();
        assert!(matches!(err, Error::Topology { .. }));
    }
}
