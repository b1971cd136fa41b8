use std::env;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{config_path, load_config};
use crate::data_handling::annotations::AnnotationDataset;
use crate::data_handling::count_table::CountTableDataset;
use crate::models::Dataset;
use crate::pipeline::run_pipeline;
use crate::report::{write_reports, ReportAnnotations};

mod aggregation;
mod analysis;
mod config;
mod count_filter;
mod data_handling;
mod error;
mod helper_functions;
mod layout;
mod models;
mod normalization;
mod pipeline;
mod report;

fn main() -> anyhow::Result<()> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting the MPRA caller");

    let path = config_path(env::args().nth(1));
    let config = load_config(&path).with_context(|| format!("reading config {}", path.display()))?;

    let counts = CountTableDataset {
        path: config.counts_path.clone(),
        separator: config.separator_byte(),
        columns: config.columns.clone(),
    };
    let raw = counts
        .load()
        .with_context(|| format!("loading count table {}", config.counts_path.display()))?;

    let annotations = ReportAnnotations {
        rsid: match &config.rsid {
            Some(source) => Some(
                AnnotationDataset { source: source.clone() }
                    .load_map()
                    .with_context(|| format!("loading rsID table {}", source.path.display()))?,
            ),
            None => None,
        },
        linkage: match &config.linkage {
            Some(source) => Some(
                AnnotationDataset { source: source.clone() }
                    .load_map()
                    .with_context(|| format!("loading linkage table {}", source.path.display()))?,
            ),
            None => None,
        },
    };

    let output = run_pipeline(&raw, &config).context("running the analysis")?;
    let summary = write_reports(&output, &annotations, &config.output_dir).context("writing reports")?;

    info!(
        "Done: {} functional variant(s){}",
        summary.functional_variants,
        summary
            .sentinel_loci
            .map(|n| format!(" at {n} sentinel loci"))
            .unwrap_or_default()
    );
    Ok(())
}
