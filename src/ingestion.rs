//! Locating and validating raw trip files.
//!
//! Raw files land under `raw/{taxi}/{taxi}_tripdata_{YYYY-MM}.{parquet|csv}`.
//! A file that is not there yet is polled with exponential backoff before
//! the pipeline gives up on it.

use anyhow::Result;
use datafusion::prelude::SessionContext;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{Layout, PipelineConfig, RetryPolicy};
use crate::engine;
use crate::error::PipelineError;
use crate::model::{Period, TaxiType};

const SOURCE_EXTENSIONS: [&str; 2] = ["parquet", "csv"];

/// One raw trip file for a taxi type and month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFile {
    pub taxi_type: TaxiType,
    pub period: Period,
    pub path: PathBuf,
    pub rows: usize,
}

/// An expected period with no raw file, left for the imputer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Gap {
    pub taxi_type: TaxiType,
    pub period: Period,
}

#[derive(Debug, Default, Serialize)]
pub struct IngestReport {
    pub sources: Vec<SourceFile>,
    pub gaps: Vec<Gap>,
}

impl IngestReport {
    pub fn total_rows(&self) -> usize {
        self.sources.iter().map(|s| s.rows).sum()
    }
}

pub fn raw_file_stem(taxi_type: TaxiType, period: Period) -> String {
    format!("{}_tripdata_{}", taxi_type, period)
}

/// Parses `yellow_tripdata_2025-01.parquet` into its taxi type and period.
pub fn parse_raw_file_name(name: &str) -> Option<(TaxiType, Period)> {
    let stem = SOURCE_EXTENSIONS
        .iter()
        .find_map(|ext| name.strip_suffix(&format!(".{ext}")))?;
    let (taxi, period) = stem.split_once("_tripdata_")?;
    Some((taxi.parse().ok()?, period.parse().ok()?))
}

/// Returns the raw file for `taxi_type` and `period`, preferring parquet.
pub fn find_source(layout: &Layout, taxi_type: TaxiType, period: Period) -> Option<PathBuf> {
    let dir = layout.raw_taxi_dir(taxi_type);
    let stem = raw_file_stem(taxi_type, period);
    SOURCE_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{stem}.{ext}")))
        .find(|p| p.exists())
}

/// Lists every recognisable raw file currently on disk.
pub fn discover_sources(layout: &Layout) -> Result<Vec<(TaxiType, Period, PathBuf)>> {
    let mut found = Vec::new();
    for taxi_type in TaxiType::ALL {
        let dir = layout.raw_taxi_dir(taxi_type);
        if !dir.exists() {
            continue;
        }
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some((taxi, period)) = parse_raw_file_name(name) {
                if taxi == taxi_type {
                    found.push((taxi, period, path));
                }
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Polls `locate` until it yields a path, sleeping with backoff in between.
///
/// `expected` names the file in the error once all attempts are spent.
pub async fn await_file<F>(policy: &RetryPolicy, expected: &Path, locate: F) -> Result<PathBuf>
where
    F: Fn() -> Option<PathBuf>,
{
    for attempt in 1..=policy.max_attempts {
        if let Some(path) = locate() {
            return Ok(path);
        }
        if attempt < policy.max_attempts {
            let delay = policy.delay_after(attempt);
            warn!(
                path = %expected.display(),
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Source file not found, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    Err(PipelineError::SourceUnavailable {
        path: expected.to_path_buf(),
        attempts: policy.max_attempts,
    }
    .into())
}

async fn count_rows(ctx: &SessionContext, path: &Path) -> Result<usize> {
    Ok(engine::read_source(ctx, path).await?.count().await?)
}

/// Checks that a raw file is readable and holds at least one row. Either
/// failure is [`PipelineError::EmptySource`].
pub async fn validate_source(ctx: &SessionContext, path: &Path) -> Result<usize> {
    let rows = match count_rows(ctx, path).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(path = %path.display(), error = %format!("{e:#}"), "Source file unreadable");
            0
        }
    };
    if rows == 0 {
        return Err(PipelineError::EmptySource(path.to_path_buf()).into());
    }
    Ok(rows)
}

/// Waits for the zone lookup and every expected raw file, then validates
/// each file. Missing files are fatal unless the period is an imputation
/// target, in which case they are reported as gaps.
#[tracing::instrument(skip_all, fields(periods = config.periods.len()))]
pub async fn ingest(config: &PipelineConfig) -> Result<IngestReport> {
    let layout = config.layout();
    let ctx = engine::session(&config.engine)?;

    await_file(&config.retry, &layout.zone_lookup, || {
        layout.zone_lookup.exists().then(|| layout.zone_lookup.clone())
    })
    .await?;

    let mut report = IngestReport::default();

    for taxi_type in TaxiType::ALL {
        for &period in &config.periods {
            let expected = layout
                .raw_taxi_dir(taxi_type)
                .join(format!("{}.parquet", raw_file_stem(taxi_type, period)));

            let located = await_file(&config.retry, &expected, || {
                find_source(&layout, taxi_type, period)
            })
            .await;

            match located {
                Ok(path) => {
                    let rows = validate_source(&ctx, &path).await?;
                    info!(taxi_type = %taxi_type, period = %period, rows, "Validated source");
                    report.sources.push(SourceFile {
                        taxi_type,
                        period,
                        path,
                        rows,
                    });
                }
                Err(_) if config.is_imputation_target(period) => {
                    warn!(taxi_type = %taxi_type, period = %period, "Source missing, left for imputation");
                    report.gaps.push(Gap { taxi_type, period });
                }
                Err(e) => return Err(e),
            }
        }
    }

    info!(
        sources = report.sources.len(),
        gaps = report.gaps.len(),
        rows = report.total_rows(),
        "Ingestion complete"
    );
    Ok(report)
}
