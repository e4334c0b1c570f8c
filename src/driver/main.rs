use anyhow::Context;
use clap::{Parser, Subcommand};
use ribasim_nl::authority::Authority;
use ribasim_nl::context::{Crs, PipelineContext};
use ribasim_nl::pipeline::{self, PipelineConfig};
use ribasim_nl::validation::Defect;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Working directory holding `deliveries/`, `models/` and `backbone.geojson`
    #[arg(long, env = "RIBASIM_NL_WORK_DIR", default_value = ".")]
    work_dir: PathBuf,
    /// Projected CRS of all inputs
    #[arg(long, env = "RIBASIM_NL_CRS", default_value = "EPSG:28992")]
    crs: Crs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build one authority model from its delivery
    Build { authority: Authority },
    /// Couple previously built authority bundles into the national model
    Couple {
        /// Authorities to couple; every built bundle when empty
        authorities: Vec<Authority>,
    },
    /// Build every delivered authority and couple them
    Run {
        /// Authorities to run; every delivered authority when empty
        authorities: Vec<Authority>,
        #[arg(long)]
        keep_intermediate: bool,
    },
    /// Validate a model bundle on disk
    Validate { dir: PathBuf },
}

/// Failure the driver reports with exit code 2.
#[derive(Debug)]
struct InvalidModel(Vec<Defect>);

impl std::fmt::Display for InvalidModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} fatal defect(s)", self.0.len())
    }
}

impl std::error::Error for InvalidModel {}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match execute(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            if is_validation_failure(&err) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn is_validation_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<InvalidModel>().is_some()
            || cause
                .downcast_ref::<ribasim_nl::Error>()
                .is_some_and(ribasim_nl::Error::is_validation)
    })
}

fn execute(args: Args) -> anyhow::Result<()> {
    let ctx = PipelineContext::new(args.work_dir, args.crs);
    let mut config = PipelineConfig::default();

    match args.command {
        Command::Build { authority } => {
            let report = pipeline::build(&ctx, authority, &config)
                .with_context(|| format!("Failed to build {authority}"))?;
            info!(%authority, findings = report.findings.len(), "Build finished");
        }
        Command::Couple { authorities } => {
            let authorities = if authorities.is_empty() {
                Authority::ALL
                    .iter()
                    .copied()
                    .filter(|a| pipeline::authority_bundle_dir(&ctx, *a).is_dir())
                    .collect()
            } else {
                authorities
            };
            let report = pipeline::couple(&ctx, &authorities, &config).context("Failed to couple models")?;
            info!(
                authorities = authorities.len(),
                findings = report.findings.len(),
                "Coupling finished"
            );
        }
        Command::Run {
            authorities,
            keep_intermediate,
        } => {
            config.keep_intermediate = keep_intermediate;
            let authorities = if authorities.is_empty() {
                pipeline::delivered_authorities(&ctx)
            } else {
                authorities
            };
            if authorities.is_empty() {
                anyhow::bail!("No deliveries found in {}", ctx.deliveries_dir().display());
            }
            let (report, summary) = pipeline::run(&ctx, &authorities, &config).context("Pipeline run failed")?;
            info!(
                findings = report.findings.len(),
                coupled = summary.coupled,
                merged = summary.merged,
                skipped = summary.skipped,
                failed = summary.failed,
                "Run finished"
            );
        }
        Command::Validate { dir } => {
            let defects = pipeline::validate_bundle(&dir)
                .with_context(|| format!("Failed to read bundle {}", dir.display()))?;
            for defect in &defects {
                if defect.is_fatal() {
                    error!(%defect, "Invalid model");
                } else {
                    warn!(%defect, "Model warning");
                }
            }
            let fatal: Vec<Defect> = defects.into_iter().filter(Defect::is_fatal).collect();
            if !fatal.is_empty() {
                return Err(InvalidModel(fatal).into());
            }
            info!(dir = %dir.display(), "Model is valid");
        }
    }
    Ok(())
}
