//! Stage sequencing. Each authority is built on its own from its delivery
//! (ingest, network, areas, edits, repair, parametrisation, control) and
//! parked in the intermediate store; concatenation and coupling then load
//! the parts into the national model.

use crate::authority::Authority;
use crate::basin_area::{self, AreaResolverConfig};
use crate::concat::{self, ConcatConfig, ConcatPart};
use crate::context::PipelineContext;
use crate::control;
use crate::coupling::{self, CouplingConfig, CouplingSummary};
use crate::edits::EditScript;
use crate::error::{Error, Result};
use crate::ingest::{Delivery, EDITS_FILE, STATIC_DATA_DIR};
use crate::model::Model;
use crate::network::model_builder::{self, ModelBuilderConfig};
use crate::network::{InputLine, Network, NetworkConfig};
use crate::parametrization::static_data::StaticData;
use crate::parametrization::{self, ParametrizationConfig};
use crate::persistence::geojson_io::{feature_geometry, read_feature_collection};
use crate::persistence::store::IntermediateStore;
use crate::persistence::{self, geojson_io::Properties};
use crate::report::{Report, Stage};
use crate::validation::repair::{self, RepairConfig};
use crate::validation::{self, Defect, Scope};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const BACKBONE_FILE: &str = "backbone.geojson";

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub network: NetworkConfig,
    pub builder: ModelBuilderConfig,
    pub areas: AreaResolverConfig,
    pub repair: RepairConfig,
    pub parametrization: ParametrizationConfig,
    pub coupling: CouplingConfig,
    pub concat: ConcatConfig,
    /// Keep the intermediate run directory after the run
    pub keep_intermediate: bool,
}

fn fail_on(stage: Stage, defects: Vec<Defect>) -> Result<()> {
    if defects.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation { stage, defects })
    }
}

fn delivery_dir(ctx: &PipelineContext, authority: Authority) -> PathBuf {
    ctx.deliveries_dir().join(authority.name())
}

/// Bundle directory of one authority.
pub fn authority_bundle_dir(ctx: &PipelineContext, authority: Authority) -> PathBuf {
    ctx.authority_dir(&authority.bundle_dir_name())
}

/// Authorities with a delivery directory, in prefix order.
pub fn delivered_authorities(ctx: &PipelineContext) -> Vec<Authority> {
    Authority::ALL
        .iter()
        .copied()
        .filter(|a| delivery_dir(ctx, *a).is_dir())
        .collect()
}

/// Runs the per-authority stages on one delivery.
pub fn build_authority(
    ctx: &PipelineContext,
    authority: Authority,
    config: &PipelineConfig,
) -> Result<(Model, Report)> {
    let dir = delivery_dir(ctx, authority);
    let mut report = Report::new();
    info!(%authority, dir = %dir.display(), "Building authority model");

    ctx.checkpoint(Stage::Ingest)?;
    let delivery = Delivery::read(&dir, &mut report)?;
    let script = EditScript::read_optional(dir.join(EDITS_FILE))?;
    let static_dir = dir.join(STATIC_DATA_DIR);
    let static_data = if static_dir.is_dir() {
        StaticData::read(&static_dir)?
    } else {
        StaticData::with_default_categories()
    };

    ctx.checkpoint(Stage::Network)?;
    let network = Network::from_lines(delivery.lines, &config.network, &mut report)?;
    let mut model = model_builder::build_model(
        network,
        &delivery.structures,
        &delivery.boundaries,
        ctx.crs,
        &config.builder,
        &mut report,
    )?;

    ctx.checkpoint(Stage::BasinArea)?;
    basin_area::resolve_basin_areas(
        &mut model,
        &delivery.areas,
        delivery.second_layer.as_deref(),
        &script.area_overrides(),
        &config.areas,
        &mut report,
    );

    ctx.checkpoint(Stage::Edit)?;
    script.apply(&mut model)?;

    ctx.checkpoint(Stage::Repair)?;
    let remaining = repair::repair(&mut model, Scope::Topology, &config.repair, &mut report)?;
    fail_on(Stage::Repair, remaining)?;

    ctx.checkpoint(Stage::Parametrization)?;
    parametrization::parametrize(
        &mut model,
        &static_data,
        &delivery.profiles,
        &config.parametrization,
        &mut report,
    );

    ctx.checkpoint(Stage::Control)?;
    control::attach_control(
        &mut model,
        &static_data,
        delivery.supply_area.as_ref(),
        &config.parametrization,
        &mut report,
    )?;
    let remaining = repair::repair(&mut model, Scope::Full, &config.repair, &mut report)?;
    fail_on(Stage::Control, remaining)?;

    info!(%authority, nodes = model.nodes.len(), links = model.links.len(), "Built authority model");
    Ok((model, report))
}

/// Builds one authority and writes its bundle.
pub fn build(ctx: &PipelineContext, authority: Authority, config: &PipelineConfig) -> Result<Report> {
    let (model, report) = build_authority(ctx, authority, config)?;
    ctx.checkpoint(Stage::Persist)?;
    persistence::write_model(&model, &authority_bundle_dir(ctx, authority), &report)?;
    Ok(report)
}

/// Backbone network from `backbone.geojson` in the work dir; empty when
/// absent.
pub fn read_backbone(path: &Path, config: &NetworkConfig, report: &mut Report) -> Result<Network> {
    if !path.exists() {
        warn!(path = %path.display(), "No backbone network, coupling links will be straight");
        return Ok(Network::default());
    }
    let lines: Vec<InputLine> = read_feature_collection(path)?
        .features
        .iter()
        .filter_map(|f| {
            let props = Properties::of(f);
            Some(InputLine {
                geometry: feature_geometry(f)?,
                code: props.str("code"),
                name: props.str("name"),
            })
        })
        .collect();
    Network::from_lines(lines, config, report)
}

/// Concatenates the parts, couples them over the backbone and revalidates.
pub fn couple_parts(
    ctx: &PipelineContext,
    parts: Vec<ConcatPart>,
    config: &PipelineConfig,
    report: &mut Report,
) -> Result<(Model, CouplingSummary)> {
    ctx.checkpoint(Stage::Concat)?;
    let mut model = concat::concat(parts, &config.concat)?;

    ctx.checkpoint(Stage::Coupling)?;
    let mut backbone = read_backbone(&ctx.work_dir.join(BACKBONE_FILE), &config.network, report)?;
    let summary = coupling::couple(&mut model, &mut backbone, &config.coupling, report)?;
    validation::ensure_valid(&model, Scope::Full, Stage::Coupling)?;
    Ok((model, summary))
}

/// Couples previously built authority bundles into the national bundle.
pub fn couple(ctx: &PipelineContext, authorities: &[Authority], config: &PipelineConfig) -> Result<Report> {
    let mut report = Report::new();
    let mut parts = Vec::with_capacity(authorities.len());
    for authority in authorities {
        let dir = authority_bundle_dir(ctx, *authority);
        parts.push(ConcatPart {
            authority: authority.name().to_string(),
            prefix: authority.prefix(),
            model: persistence::read_model(&dir)?,
        });
        report.extend(persistence::read_report(&dir)?);
    }
    let (model, _) = couple_parts(ctx, parts, config, &mut report)?;
    ctx.checkpoint(Stage::Persist)?;
    persistence::write_model(&model, &ctx.national_dir(), &report)?;
    Ok(report)
}

/// Full run: builds every authority one at a time, parks the models in the
/// intermediate store, then concatenates, couples and writes.
pub fn run(ctx: &PipelineContext, authorities: &[Authority], config: &PipelineConfig) -> Result<(Report, CouplingSummary)> {
    let store = IntermediateStore::new(&ctx.work_dir, config.keep_intermediate)?;
    let mut report = Report::new();
    for authority in authorities {
        let (model, authority_report) = build_authority(ctx, *authority, config)?;
        persistence::write_model(&model, &authority_bundle_dir(ctx, *authority), &authority_report)?;
        store.store(authority.name(), &model)?;
        report.extend(authority_report);
    }

    let mut parts = Vec::with_capacity(authorities.len());
    for authority in authorities {
        parts.push(ConcatPart {
            authority: authority.name().to_string(),
            prefix: authority.prefix(),
            model: store.load(authority.name())?,
        });
    }
    let (model, summary) = couple_parts(ctx, parts, config, &mut report)?;
    ctx.checkpoint(Stage::Persist)?;
    persistence::write_model(&model, &ctx.national_dir(), &report)?;
    info!(
        authorities = authorities.len(),
        nodes = model.nodes.len(),
        coupled = summary.coupled + summary.merged,
        "Finished national model"
    );
    Ok((report, summary))
}

/// Validates a bundle on disk and returns every defect, fatal or not.
pub fn validate_bundle(dir: &Path) -> Result<Vec<Defect>> {
    let model = persistence::read_model(dir)?;
    Ok(validation::validate(&model, Scope::Full))
}
