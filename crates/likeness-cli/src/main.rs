use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use likeness_core::{CropMode, CropPlan, StrategyKind};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod config;
mod curate;
mod export;
mod manifest;

use manifest::DetectionManifest;

#[derive(Parser)]
#[command(
    name = "likeness",
    version,
    about = "Square crops and identity consensus for single-subject image sets"
)]
struct Cli {
    /// TOML config file; LIKENESS_* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print crop plans for every image in a detector manifest
    Crop {
        /// Detector manifest (JSON)
        #[arg(short, long)]
        detections: PathBuf,
        /// Framing mode; repeat for several (default: from config)
        #[arg(short, long)]
        mode: Vec<CropMode>,
    },
    /// Run identity consensus over primary-face embeddings, skipping images
    /// whose face box is invalid (as `curate` does)
    Consensus {
        /// Detector manifest (JSON)
        #[arg(short, long)]
        detections: PathBuf,
        /// centroid or density (default: from config)
        #[arg(short, long)]
        strategy: Option<StrategyKind>,
    },
    /// Plan crops, filter by consensus, and optionally export kept crops
    Curate {
        /// Detector manifest (JSON)
        #[arg(short, long)]
        detections: PathBuf,
        /// Directory holding the source images named by manifest ids
        #[arg(long, requires = "out")]
        images: Option<PathBuf>,
        /// Directory to write square crops into
        #[arg(long, requires = "images")]
        out: Option<PathBuf>,
        /// Write the JSON report here instead of stdout
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Serialize)]
struct ImagePlans<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    plans: Vec<CropPlan>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Crop { detections, mode } => {
            if !mode.is_empty() {
                cfg.modes = mode;
            }
            let manifest = DetectionManifest::load(&detections)?;
            let plans: Vec<ImagePlans> = manifest
                .images
                .iter()
                .map(|image| match curate::plan_image(image, &cfg) {
                    Ok(plans) => ImagePlans { id: &image.id, error: None, plans },
                    Err(e) => {
                        tracing::warn!(id = %image.id, error = %e, "skipping image with invalid geometry");
                        ImagePlans { id: &image.id, error: Some(e.to_string()), plans: Vec::new() }
                    }
                })
                .collect();
            emit(&plans, None)?;
        }
        Commands::Consensus { detections, strategy } => {
            if let Some(strategy) = strategy {
                cfg.consensus.strategy = strategy;
            }
            let manifest = DetectionManifest::load(&detections)?;
            let outcome = curate::consensus_outcome(&manifest, &cfg)?;
            emit(&outcome, None)?;
        }
        Commands::Curate {
            detections,
            images,
            out,
            report,
        } => {
            let manifest = DetectionManifest::load(&detections)?;
            let curation = curate::curate(&manifest, &cfg)?;

            if let (Some(images), Some(out)) = (images, out) {
                let stats = export::export_crops(&curation, &images, &out)?;
                eprintln!(
                    "Exported {} crops ({} images skipped) to {}",
                    stats.written,
                    stats.skipped,
                    out.display()
                );
            }

            emit(&curation, report.as_deref())?;
            let s = &curation.summary;
            eprintln!(
                "Kept {}/{} images ({} rejected, {} without a face, {} invalid)",
                s.kept, s.images, s.rejected, s.no_face, s.invalid
            );
        }
        Commands::Config => {
            print!("{}", config::to_toml(&cfg)?);
        }
    }

    Ok(())
}

/// Pretty JSON to `path`, or stdout when no path is given.
fn emit<T: Serialize>(value: &T, path: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match path {
        Some(path) => {
            std::fs::write(path, json + "\n").with_context(|| format!("writing {}", path.display()))?;
            tracing::info!(path = %path.display(), "report written");
        }
        None => println!("{json}"),
    }
    Ok(())
}
