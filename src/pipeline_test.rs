use crate::authority::Authority;
use crate::basin_area::{self, AreaResolverConfig, AssignmentMethod, CandidateArea};
use crate::concat::{self, ConcatConfig, ConcatPart};
use crate::context::{Crs, PipelineContext};
use crate::error::Error;
use crate::geometry::MultiPolygon;
use crate::ingest::test_support::{line, point, square, write_layer};
use crate::ingest::{AREAS_FILE, LINKS_FILE, NODES_FILE, STATIC_DATA_DIR, STRUCTURES_FILE, SUPPLY_AREA_FILE};
use crate::model::node::{META_FROM_AUTHORITY, META_TO_AUTHORITY};
use crate::model::tables::{BasinProfile, BasinState, StructureStatic};
use crate::model::{LinkType, Model, NodeType};
use crate::persistence;
use crate::pipeline::{self, PipelineConfig};
use crate::report::{FindingKind, Report, Stage};
use crate::validation::repair::{self, RepairConfig};
use crate::validation::{self, Defect, Scope};
use geo_types::polygon;
use proptest::prelude::*;
use proptest::test_runner::{Config as PropConfig, RngAlgorithm, TestRng, TestRunner};
use serde_json::json;
use std::path::PathBuf;

fn work_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ribasim_nl_pipeline_{name}_{}", uuid::Uuid::new_v4()))
}

/// Water course from `x0` to `x0 + 200` with a pump halfway and one area
/// per half.
fn write_delivery(ctx: &PipelineContext, authority: Authority, x0: f64, couple_to: Option<&str>) {
    let dir = ctx.deliveries_dir().join(authority.name());
    write_layer(&dir, LINKS_FILE, vec![line(&[(x0, 0.0), (x0 + 200.0, 0.0)], "W1")]);
    write_layer(
        &dir,
        STRUCTURES_FILE,
        vec![point(x0 + 100.0, 1.0, json!({"code": "KGM-1", "type": "gemaal"}))],
    );
    write_layer(
        &dir,
        AREAS_FILE,
        vec![
            square(x0, -50.0, 100.0, json!({"code": "P1", "streefpeil": -0.4})),
            square(x0 + 100.0, -50.0, 100.0, json!({"code": "P2", "streefpeil": -0.2})),
        ],
    );
    let boundaries = match couple_to {
        Some(partner) => vec![point(
            x0 + 200.0,
            0.0,
            json!({"node_type": "LevelBoundary", "code": "GRENS", "meta_couple_authority": partner}),
        )],
        None => vec![],
    };
    write_layer(&dir, NODES_FILE, boundaries);
}

fn basin_left_of(model: &Model, x: f64) -> i64 {
    model
        .nodes_of_type(NodeType::Basin)
        .find(|n| n.geometry.x() < x)
        .map(|n| n.node_id)
        .unwrap()
}

fn fatal(model: &Model) -> Vec<Defect> {
    validation::validate(model, Scope::Full)
        .into_iter()
        .filter(Defect::is_fatal)
        .collect()
}

#[test]
fn test_delivery_builds_two_basin_chain() {
    let ctx = PipelineContext::new(work_dir("chain"), Crs::default());
    write_delivery(&ctx, Authority::Rijnland, 0.0, None);

    let config = PipelineConfig::default();
    let (model, report) = pipeline::build_authority(&ctx, Authority::Rijnland, &config).unwrap();
    assert_eq!(model.nodes_of_type(NodeType::Basin).count(), 2);
    let pump = model.nodes_of_type(NodeType::Pump).next().unwrap();
    assert_eq!(pump.code(), Some("KGM-1"));
    assert_eq!(model.upstream_node_ids(pump.node_id), vec![basin_left_of(&model, 100.0)]);
    assert_eq!(model.basin_areas.len(), 2);
    assert_eq!(model.target_level(basin_left_of(&model, 100.0)), Some(-0.4));
    assert!(fatal(&model).is_empty());
    assert_eq!(report.count(FindingKind::UnassignedBasinArea), 0);

    pipeline::build(&ctx, Authority::Rijnland, &config).unwrap();
    let dir = pipeline::authority_bundle_dir(&ctx, Authority::Rijnland);
    let back = persistence::read_model(&dir).unwrap();
    assert_eq!(back.nodes.keys().collect::<Vec<_>>(), model.nodes.keys().collect::<Vec<_>>());
    assert_eq!(back.links.len(), model.links.len());
    assert!(pipeline::validate_bundle(&dir).unwrap().iter().all(|d| !d.is_fatal()));
    std::fs::remove_dir_all(&ctx.work_dir).unwrap();
}

fn write_sheet(ctx: &PipelineContext, authority: Authority, file: &str, contents: &str) {
    let dir = ctx.deliveries_dir().join(authority.name()).join(STATIC_DATA_DIR);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(file), contents).unwrap();
}

fn level_boundary_level(model: &Model) -> f64 {
    let lb = model.nodes_of_type(NodeType::LevelBoundary).next().unwrap().node_id;
    model
        .tables
        .level_boundary_static
        .iter()
        .find(|r| r.node_id == lb)
        .map(|r| r.level)
        .unwrap()
}

/// Controller of a structure and the basin it listens to.
fn discrete_control_of(model: &Model, node_id: i64) -> (i64, i64) {
    let control = model
        .control_links()
        .find(|l| l.to_node_id == node_id)
        .map(|l| l.from_node_id)
        .unwrap();
    let listen = model
        .tables
        .discrete_control_variable
        .iter()
        .find(|v| v.node_id == control)
        .map(|v| v.listen_node_id)
        .unwrap();
    (control, listen)
}

#[test]
fn test_sheet_levels_fill_basins_and_boundaries() {
    let ctx = PipelineContext::new(work_dir("sheets"), Crs::default());
    write_delivery(&ctx, Authority::Rijnland, 0.0, Some("Delfland"));
    // left area without streefpeil
    write_layer(
        &ctx.deliveries_dir().join(Authority::Rijnland.name()),
        AREAS_FILE,
        vec![
            square(0.0, -50.0, 100.0, json!({"code": "P1"})),
            square(100.0, -50.0, 100.0, json!({"code": "P2", "streefpeil": -0.2})),
        ],
    );
    write_sheet(
        &ctx,
        Authority::Rijnland,
        "Pump.csv",
        "node_id,name,code,flow_rate,min_upstream_level,max_downstream_level,categorie\n,,KGM-1,,-1.25,,\n",
    );
    write_sheet(&ctx, Authority::Rijnland, "LevelBoundary.csv", "code,level\nGRENS,1.5\n");

    let config = PipelineConfig::default();
    let (model, report) = pipeline::build_authority(&ctx, Authority::Rijnland, &config).unwrap();
    let left = basin_left_of(&model, 100.0);
    assert_eq!(model.target_level(left), Some(-1.25));
    let pump = model.nodes_of_type(NodeType::Pump).next().unwrap().node_id;
    assert!(
        model
            .tables
            .pump_static
            .iter()
            .filter(|r| r.node_id == pump)
            .all(|r| r.min_upstream_level == Some(-1.25))
    );
    assert_eq!(level_boundary_level(&model), 1.5);
    assert_eq!(report.count(FindingKind::MissingParameter), 0);
    assert!(fatal(&model).is_empty());

    // without a sheet row the boundary takes the level of the basin behind its outlet
    write_sheet(&ctx, Authority::Rijnland, "LevelBoundary.csv", "code,level\n");
    let (model, _) = pipeline::build_authority(&ctx, Authority::Rijnland, &config).unwrap();
    assert_eq!(level_boundary_level(&model), -0.2);
    assert_eq!(model.target_level(basin_left_of(&model, 100.0)), Some(-1.25));
    std::fs::remove_dir_all(&ctx.work_dir).unwrap();
}

#[test]
fn test_supply_area_decides_drain_control() {
    let ctx = PipelineContext::new(work_dir("supply"), Crs::default());
    for authority in [Authority::Rijnland, Authority::Delfland] {
        write_delivery(&ctx, authority, 0.0, None);
        write_layer(
            &ctx.deliveries_dir().join(authority.name()),
            STRUCTURES_FILE,
            vec![point(100.0, 1.0, json!({"code": "KGM-1", "type": "gemaal", "meta_function": "inlet"}))],
        );
    }
    // only the left basin lies inside the supply area
    write_layer(
        &ctx.deliveries_dir().join(Authority::Rijnland.name()),
        SUPPLY_AREA_FILE,
        vec![square(-10.0, -60.0, 100.0, json!({}))],
    );

    let config = PipelineConfig::default();
    let (model, _) = pipeline::build_authority(&ctx, Authority::Rijnland, &config).unwrap();
    let pump = model.nodes_of_type(NodeType::Pump).next().unwrap().node_id;
    let (control, listen) = discrete_control_of(&model, pump);
    assert_eq!(model.node_type(control), Some(NodeType::DiscreteControl));
    assert_eq!(listen, basin_left_of(&model, 100.0));
    let logic: Vec<(&str, &str)> = model
        .tables
        .discrete_control_logic
        .iter()
        .filter(|l| l.node_id == control)
        .map(|l| (l.truth_state.as_str(), l.control_state.as_str()))
        .collect();
    assert_eq!(logic, vec![("F", "off"), ("T", "on")]);
    assert!(fatal(&model).is_empty());

    // without a supply area the delivered function makes it an inlet
    let (model, _) = pipeline::build_authority(&ctx, Authority::Delfland, &config).unwrap();
    let pump = model.nodes_of_type(NodeType::Pump).next().unwrap().node_id;
    let (_, listen) = discrete_control_of(&model, pump);
    assert_ne!(listen, basin_left_of(&model, 100.0));
    assert_eq!(model.node_type(listen), Some(NodeType::Basin));
    std::fs::remove_dir_all(&ctx.work_dir).unwrap();
}

#[test]
fn test_dangling_connector_is_repaired() {
    let ctx = PipelineContext::new(work_dir("dangling"), Crs::default());
    let dir = ctx.deliveries_dir().join(Authority::Delfland.name());
    write_layer(&dir, LINKS_FILE, vec![line(&[(0.0, 0.0), (200.0, 0.0)], "W1")]);
    // pump at the downstream end of the water course
    write_layer(
        &dir,
        STRUCTURES_FILE,
        vec![point(200.0, 0.0, json!({"code": "KGM-9", "type": "gemaal"}))],
    );
    write_layer(
        &dir,
        AREAS_FILE,
        vec![square(0.0, -50.0, 150.0, json!({"code": "P1", "streefpeil": 0.1}))],
    );

    let (model, report) = pipeline::build_authority(&ctx, Authority::Delfland, &PipelineConfig::default()).unwrap();
    let pump = model.nodes_of_type(NodeType::Pump).next().unwrap();
    let downstream = model.downstream_node_ids(pump.node_id);
    assert_eq!(downstream.len(), 1);
    assert_eq!(model.node_type(downstream[0]), Some(NodeType::LevelBoundary));
    assert!(report.count(FindingKind::AutomaticRepair) >= 1);
    assert!(fatal(&model).is_empty());
    std::fs::remove_dir_all(&ctx.work_dir).unwrap();
}

#[test]
fn test_duplicate_link_is_removed_once() {
    let ctx = PipelineContext::new(work_dir("duplicate"), Crs::default());
    write_delivery(&ctx, Authority::Rijnland, 0.0, None);
    let (mut model, _) = pipeline::build_authority(&ctx, Authority::Rijnland, &PipelineConfig::default()).unwrap();
    let links_before = model.links.len();
    let pump = model.nodes_of_type(NodeType::Pump).next().unwrap().node_id;
    let basin = model.upstream_node_ids(pump)[0];
    model.add_link(basin, pump, LinkType::Flow).unwrap();

    let mut report = Report::new();
    let remaining = repair::repair(&mut model, Scope::Full, &RepairConfig::default(), &mut report).unwrap();
    assert!(remaining.is_empty(), "{remaining:?}");
    assert_eq!(model.links.len(), links_before);
    let repairs = report.count(FindingKind::AutomaticRepair);
    assert!(repairs >= 1);

    let again = repair::repair(&mut model, Scope::Full, &RepairConfig::default(), &mut report).unwrap();
    assert!(again.is_empty());
    assert_eq!(report.count(FindingKind::AutomaticRepair), repairs);
    std::fs::remove_dir_all(&ctx.work_dir).unwrap();
}

#[test]
fn test_area_goes_to_largest_overlap() {
    let ctx = PipelineContext::new(work_dir("overlap"), Crs::default());
    write_delivery(&ctx, Authority::Rijnland, 0.0, None);
    let (mut model, _) = pipeline::build_authority(&ctx, Authority::Rijnland, &PipelineConfig::default()).unwrap();
    let left = basin_left_of(&model, 100.0);

    let rect = |x0: f64, x1: f64| {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: -50.0), (x: x1, y: -50.0), (x: x1, y: 50.0), (x: x0, y: 50.0), (x: x0, y: -50.0)
        ]])
    };
    // 90 of 100 m wide over the left basin area
    let mut report = Report::new();
    let assignments = basin_area::resolve_basin_areas(
        &mut model,
        &[CandidateArea::new(rect(10.0, 110.0))],
        None,
        &[],
        &AreaResolverConfig::default(),
        &mut report,
    );
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].node_id, left);
    assert_eq!(assignments[0].method, AssignmentMethod::Overlap);
    assert!((assignments[0].overlap_fraction - 0.9).abs() < 1e-9);
    assert_eq!(report.count(FindingKind::LowOverlap), 1);
    assert!(
        !validation::validate(&model, Scope::Topology)
            .iter()
            .any(|d| matches!(d, Defect::OverlappingBasinAreas { .. }))
    );
    std::fs::remove_dir_all(&ctx.work_dir).unwrap();
}

#[test]
fn test_run_couples_authorities() {
    let ctx = PipelineContext::new(work_dir("couple"), Crs::default());
    write_delivery(&ctx, Authority::Rijnland, 0.0, Some("Delfland"));
    write_delivery(&ctx, Authority::Delfland, 1000.0, None);

    let authorities = pipeline::delivered_authorities(&ctx);
    assert_eq!(authorities, vec![Authority::Rijnland, Authority::Delfland]);
    let (report, summary) = pipeline::run(&ctx, &authorities, &PipelineConfig::default()).unwrap();
    assert_eq!(summary.coupled, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(report.count(FindingKind::Coupled), 1);

    let national = persistence::read_model(&ctx.national_dir()).unwrap();
    assert_eq!(national.nodes_of_type(NodeType::LevelBoundary).count(), 0);
    assert_eq!(national.authorities(), vec!["Delfland", "Rijnland"]);
    let coupling_link = national
        .links
        .values()
        .find(|l| l.meta.contains_key(META_FROM_AUTHORITY))
        .unwrap();
    assert_eq!(
        coupling_link.meta.get(META_FROM_AUTHORITY).and_then(|v| v.as_str()),
        Some("Rijnland")
    );
    assert_eq!(
        coupling_link.meta.get(META_TO_AUTHORITY).and_then(|v| v.as_str()),
        Some("Delfland")
    );
    assert_eq!(national.node_type(coupling_link.to_node_id), Some(NodeType::Basin));
    assert!(pipeline::authority_bundle_dir(&ctx, Authority::Delfland).is_dir());
    assert!(fatal(&national).is_empty());
    std::fs::remove_dir_all(&ctx.work_dir).unwrap();
}

#[test]
fn test_cancelled_run_stops_at_checkpoint() {
    let ctx = PipelineContext::new(work_dir("cancel"), Crs::default());
    write_delivery(&ctx, Authority::Rijnland, 0.0, None);
    ctx.cancel.cancel();
    let err = pipeline::build_authority(&ctx, Authority::Rijnland, &PipelineConfig::default()).unwrap_err();
    assert!(matches!(err, Error::Cancelled { stage: Stage::Ingest }));
    std::fs::remove_dir_all(&ctx.work_dir).unwrap();
}

/// Basin, pump, basin, ... with `pumps` pumps.
fn chain(pumps: usize) -> Model {
    let mut model = Model::new(Crs::default());
    let mut upstream = model.add_node(NodeType::Basin, crate::geometry::Point::new(0.0, 0.0));
    for i in 0..pumps {
        let x = (i as f64 + 1.0) * 200.0;
        let pump = model.add_node(NodeType::Pump, crate::geometry::Point::new(x - 100.0, 0.0));
        let basin = model.add_node(NodeType::Basin, crate::geometry::Point::new(x, 0.0));
        model.add_link(upstream, pump, LinkType::Flow).unwrap();
        model.add_link(pump, basin, LinkType::Flow).unwrap();
        model.tables.pump_static.push(StructureStatic::new(pump, 1.0));
        upstream = basin;
    }
    for basin in model.node_ids_of_type(NodeType::Basin) {
        model.tables.basin_profile.push(BasinProfile { node_id: basin, level: 0.0, area: 1.0 });
        model.tables.basin_profile.push(BasinProfile { node_id: basin, level: 1.0, area: 100.0 });
        model.tables.basin_state.push(BasinState { node_id: basin, level: 0.5 });
    }
    model
}

#[test]
fn test_prefixes_with_five_digits() {
    let parts = vec![
        ConcatPart { authority: "A".to_string(), prefix: 10, model: chain(1) },
        ConcatPart { authority: "B".to_string(), prefix: 20, model: chain(1) },
    ];
    let model = concat::concat(parts, &ConcatConfig { digits: Some(5) }).unwrap();
    assert!(model.nodes.contains_key(&1_000_001));
    assert!(model.nodes.contains_key(&2_000_001));
    assert!(model.links.contains_key(&2_000_002));
    assert_eq!(model.nodes.len(), 6);
}

#[test]
fn proptest_concat_keeps_references() {
    const SEED_BYTES: [u8; 32] = [
        0x13, 0x15, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    ];
    let rng = TestRng::from_seed(RngAlgorithm::ChaCha, &SEED_BYTES);
    let mut runner = TestRunner::new_with_rng(PropConfig::with_cases(64), rng);

    let strategy = (
        prop::collection::btree_set(1i64..100, 1..5),
        prop::collection::vec(1usize..6, 4),
    );
    runner
        .run(&strategy, |(prefixes, sizes)| {
            let parts: Vec<ConcatPart> = prefixes
                .iter()
                .zip(sizes.iter().cycle())
                .map(|(prefix, size)| ConcatPart {
                    authority: format!("WS{prefix}"),
                    prefix: *prefix,
                    model: chain(*size),
                })
                .collect();
            let node_total: usize = parts.iter().map(|p| p.model.nodes.len()).sum();
            let link_total: usize = parts.iter().map(|p| p.model.links.len()).sum();
            let model = concat::concat(parts, &ConcatConfig::default()).unwrap();

            prop_assert_eq!(model.nodes.len(), node_total);
            prop_assert_eq!(model.links.len(), link_total);
            for link in model.links.values() {
                prop_assert!(model.nodes.contains_key(&link.from_node_id));
                prop_assert!(model.nodes.contains_key(&link.to_node_id));
            }
            for row in &model.tables.pump_static {
                prop_assert_eq!(model.node_type(row.node_id), Some(NodeType::Pump));
            }

            let reset = concat::reset_index(model, 1, 1);
            prop_assert_eq!(reset.nodes.keys().copied().collect::<Vec<_>>(), (1..=node_total as i64).collect::<Vec<_>>());
            prop_assert!(fatal(&reset).is_empty());
            Ok(())
        })
        .unwrap();
}
