//! sc_ana

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::Parser;
use env_logger::Builder;
use log::{error, info, LevelFilter};
use sc_ana::config::PipelineConfig;
use sc_ana::io::{
    load_counts_csv, load_embedding_csv, load_metadata_csv, save_clustering, save_embedding, save_uns,
};
use sc_ana::registry::StageKind;
use sc_ana::{plan_pipeline, run_pipeline, PipelineOptions, StageState};
use sc_types::{Dataset, MatrixState};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
struct Input {
    /// Options file (TOML); every option not listed keeps its default.
    #[clap(long)]
    options: Option<PathBuf>,
    /// Cell-by-gene CSV: a `Barcode` column followed by one column per gene.
    #[clap(long)]
    counts: PathBuf,
    /// Cell attributes keyed by barcode.
    #[clap(long)]
    metadata: Option<PathBuf>,
    /// Precomputed basis as NAME=PATH, e.g. pca=pca_components/projection.csv.
    #[clap(long = "basis", value_parser = parse_basis)]
    bases: Vec<(String, PathBuf)>,
    #[clap(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Debug, Parser)]
#[clap(name = "sc_ana", about = "Single-cell clustering pipeline")]
enum Args {
    /// Run the enabled stages and write clusterings and embeddings.
    Cluster {
        #[clap(flatten)]
        input: Input,
        /// Output directory.
        #[clap(long)]
        output: PathBuf,
    },
    /// Print the stage order for the given options and data without running it.
    Plan {
        #[clap(flatten)]
        input: Input,
    },
    /// Print every option with its default value.
    Defaults,
}

fn parse_basis(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => Ok((name.to_string(), PathBuf::from(path))),
        _ => Err(format!("expected NAME=PATH, got '{s}'")),
    }
}

fn setup_logging(level: LevelFilter) {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level)
        .init();
}

fn load(input: &Input) -> Result<(PipelineConfig, Dataset)> {
    setup_logging(input.log_level);
    let options = match &input.options {
        Some(path) => PipelineOptions::from_toml_file(path)?,
        None => PipelineOptions::default(),
    };
    let config = options.resolve()?;
    let mut ds = load_counts_csv(&input.counts)?;
    if config.processed {
        ds = ds.with_state(MatrixState::Normalized);
    }
    if let Some(path) = &input.metadata {
        load_metadata_csv(path, &mut ds)?;
    }
    for (name, path) in &input.bases {
        load_embedding_csv(path, name, &mut ds).with_context(|| format!("basis {name}"))?;
    }
    info!(
        "loaded {} cells x {} genes from {}",
        ds.n_cells(),
        ds.n_features(),
        input.counts.display()
    );
    Ok((config, ds))
}

fn class_labels(config: &PipelineConfig) -> Vec<(StageKind, &str)> {
    let mut labels = Vec::new();
    if let Some(p) = &config.louvain {
        labels.push((StageKind::Louvain, p.class_label.as_str()));
    }
    if let Some(p) = &config.leiden {
        labels.push((StageKind::Leiden, p.class_label.as_str()));
    }
    if let Some(p) = &config.spectral_louvain {
        labels.push((StageKind::SpectralLouvain, p.class_label.as_str()));
    }
    if let Some(p) = &config.spectral_leiden {
        labels.push((StageKind::SpectralLeiden, p.class_label.as_str()));
    }
    labels
}

fn cluster(input: &Input, output: &Path) -> Result<()> {
    let (config, mut ds) = load(input)?;
    let report = run_pipeline(&config, &mut ds)?;

    for (kind, label) in class_labels(&config) {
        if report.states.get(&kind) == Some(&StageState::Done) {
            save_clustering(output, label, ds.barcodes(), ds.obs().require(label)?)?;
        }
    }
    for name in ds.embedding_names() {
        if let Some(embedding) = ds.embedding(name) {
            save_embedding(output, name, ds.barcodes(), embedding)?;
        }
    }
    save_uns(output, ds.uns())?;

    let failures = report.failures();
    if !failures.is_empty() {
        for failure in &failures {
            error!("{failure}");
        }
        bail!("{} of {} stages failed", failures.len(), report.plan.stages.len());
    }
    info!("wrote results to {}", output.display());
    Ok(())
}

fn main() -> Result<()> {
    match Args::parse() {
        Args::Cluster { input, output } => cluster(&input, &output),
        Args::Plan { input } => {
            let (config, ds) = load(&input)?;
            let plan = plan_pipeline(&config, &ds)?;
            for stage in &plan.stages {
                match stage.basis {
                    Some(basis) => println!("{}\t{basis}", stage.kind),
                    None => println!("{}", stage.kind),
                }
            }
            for fallback in &plan.fallbacks {
                println!(
                    "# {} uses '{}' in place of '{}'",
                    fallback.stage, fallback.used, fallback.preferred
                );
            }
            Ok(())
        }
        Args::Defaults => {
            print!("{}", toml::to_string(&PipelineOptions::default())?);
            Ok(())
        }
    }
}
