//! Compliance, leakage and comparison aggregates.
//!
//! This module reduces the zone-filtered trips into daily tables and JSON
//! summaries for the reporting collaborators, and compares the two taxi
//! types across the clean tables.

pub mod comparison;
pub mod daily;
pub mod leakage;
pub mod types;
pub mod utility;

use anyhow::Result;
use tracing::info;

use crate::cleaning::detect::CLEAN_TAG;
use crate::config::PipelineConfig;
use crate::engine;
use crate::error::{PipelineError, require_upstream};
use crate::model::parse_stage_file_name;
use crate::output;
use crate::zones::ZoneLookup;

use types::AggregateReport;

/// Runs every aggregation and writes its outputs under `aggregated/`.
#[tracing::instrument(skip_all)]
pub async fn run_aggregations(config: &PipelineConfig) -> Result<AggregateReport> {
    let layout = config.layout();
    require_upstream("aggregate", &layout.zone_trips)?;
    require_upstream("aggregate", &layout.clean_dir)?;

    let clean_tables: Vec<_> = engine::list_parquet(&layout.clean_dir)?
        .into_iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| parse_stage_file_name(n, CLEAN_TAG))
                .is_some()
        })
        .collect();
    if clean_tables.is_empty() {
        return Err(PipelineError::MissingUpstream {
            stage: "aggregate",
            path: layout.clean_dir.clone(),
        }
        .into());
    }

    let lookup = ZoneLookup::load(&layout.zone_lookup)?;
    let ctx = engine::session(&config.engine)?;
    engine::register_parquet_files(&ctx, "zone_trips", &[layout.zone_trips.clone()]).await?;
    engine::register_parquet_files(&ctx, "clean_trips", &clean_tables).await?;

    let daily_zone_rows =
        daily::daily_zone_aggregates(&ctx, &layout.aggregated(daily::DAILY_ZONE_FILE)).await?;
    let category_rows =
        daily::trips_by_zone_category(&ctx, &layout.aggregated(daily::CATEGORY_FILE)).await?;

    let leakage = leakage::analyze_leakage(&ctx, &config.analysis, &lookup).await?;
    output::write_json(&layout.aggregated(leakage::LEAKAGE_FILE), &leakage)?;

    let comparison = comparison::compare_taxi_types(&ctx, &config.analysis).await?;
    output::write_json(&layout.aggregated(comparison::COMPARISON_FILE), &comparison)?;

    info!(daily_zone_rows, category_rows, "Aggregation complete");
    Ok(AggregateReport {
        daily_zone_rows,
        category_rows,
        leakage,
        comparison,
    })
}
