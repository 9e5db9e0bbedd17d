//! Sequential stage orchestration.
//!
//! Stages run in dependency order on one task and the run stops at the
//! first failure. Every attempted stage is appended to
//! `audit/pipeline_runs.csv`, failed ones included.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tracing::{error, info};

use crate::config::PipelineConfig;
use crate::{analysis, cleaning, imputation, ingestion, output, schema, weather, zones};

pub const PIPELINE_RUNS_FILE: &str = "pipeline_runs.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Stage {
    Ingest,
    Unify,
    Clean,
    Impute,
    Zones,
    Aggregate,
    Weather,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Ingest,
        Stage::Unify,
        Stage::Clean,
        Stage::Impute,
        Stage::Zones,
        Stage::Aggregate,
        Stage::Weather,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Unify => "unify",
            Stage::Clean => "clean",
            Stage::Impute => "impute",
            Stage::Zones => "zones",
            Stage::Aggregate => "aggregate",
            Stage::Weather => "weather",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a stage produced, in the unit that makes sense for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageOutcome {
    pub rows: usize,
    pub detail: String,
}

/// One row of `pipeline_runs.csv`.
#[derive(Debug, Clone, Serialize)]
pub struct StageRun {
    pub run_id: String,
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: &'static str,
    pub rows: usize,
    pub detail: String,
}

/// Runs a single stage against whatever its upstream stages left on disk.
#[tracing::instrument(skip(config))]
pub async fn run_stage(config: &PipelineConfig, stage: Stage) -> Result<StageOutcome> {
    let outcome = match stage {
        Stage::Ingest => {
            let report = ingestion::ingest(config).await?;
            StageOutcome {
                rows: report.total_rows(),
                detail: format!("{} sources, {} gaps", report.sources.len(), report.gaps.len()),
            }
        }
        Stage::Unify => {
            let outcomes = schema::unify_all(config).await?;
            let malformed: usize = outcomes.iter().map(|o| o.malformed_rows).sum();
            let skipped = outcomes.iter().filter(|o| o.skipped).count();
            StageOutcome {
                rows: outcomes.iter().map(|o| o.rows).sum(),
                detail: format!("{} files, {skipped} skipped, {malformed} malformed rows", outcomes.len()),
            }
        }
        Stage::Clean => {
            let reports = cleaning::clean_all(config).await?;
            let ghosts: usize = reports.iter().map(|r| r.ghost_rows).sum();
            StageOutcome {
                rows: reports.iter().map(|r| r.clean_rows).sum(),
                detail: format!("{} files, {ghosts} ghost trips", reports.len()),
            }
        }
        Stage::Impute => {
            let outcomes = imputation::impute_all(config).await?;
            let imputed = outcomes.iter().filter(|o| o.imputed).count();
            StageOutcome {
                rows: outcomes.iter().map(|o| o.days).sum(),
                detail: format!("{imputed} of {} gaps imputed", outcomes.len()),
            }
        }
        Stage::Zones => {
            let report = zones::filter_zone_trips(config).await?;
            StageOutcome {
                rows: report.rows,
                detail: format!("{} congestion zones", report.zone_ids.len()),
            }
        }
        Stage::Aggregate => {
            let report = analysis::run_aggregations(config).await?;
            StageOutcome {
                rows: report.daily_zone_rows,
                detail: format!(
                    "leakage {:.2}%, {} category rows",
                    report.leakage.leakage_pct, report.category_rows
                ),
            }
        }
        Stage::Weather => {
            let summary = weather::join_weather(config).await?;
            StageOutcome {
                rows: summary.days,
                detail: format!("{} days with weather", summary.days_with_weather),
            }
        }
    };
    Ok(outcome)
}

async fn run_logged(config: &PipelineConfig, run_id: &str, stage: Stage) -> Result<StageRun> {
    let started_at = Utc::now();
    let timer = Instant::now();
    info!(stage = %stage, "Stage starting");

    let result = run_stage(config, stage).await;
    let duration_ms = timer.elapsed().as_millis() as u64;

    let (run, outcome) = match result {
        Ok(outcome) => (
            StageRun {
                run_id: run_id.to_string(),
                stage: stage.to_string(),
                started_at,
                duration_ms,
                status: "ok",
                rows: outcome.rows,
                detail: outcome.detail,
            },
            Ok(()),
        ),
        Err(e) => (
            StageRun {
                run_id: run_id.to_string(),
                stage: stage.to_string(),
                started_at,
                duration_ms,
                status: "failed",
                rows: 0,
                detail: format!("{e:#}"),
            },
            Err(e),
        ),
    };

    output::append_record(&config.layout().audit_dir.join(PIPELINE_RUNS_FILE), &run)?;
    match outcome {
        Ok(()) => {
            info!(stage = %stage, rows = run.rows, duration_ms = run.duration_ms, detail = %run.detail, "Stage complete");
            Ok(run)
        }
        Err(e) => {
            error!(stage = %stage, error = %format!("{e:#}"), "Stage failed");
            Err(e.context(format!("stage `{stage}` failed")))
        }
    }
}

/// Runs every stage in order, stopping at the first failure.
#[tracing::instrument(skip(config), fields(data_dir = %config.data_dir.display()))]
pub async fn run_all(config: &PipelineConfig, skip_ingest: bool) -> Result<Vec<StageRun>> {
    config.validate()?;
    config.layout().create_directories()?;

    let run_id = Utc::now().format("%Y%m%dT%H%M%S%.3f").to_string();
    let mut runs = Vec::new();
    for stage in Stage::ALL {
        if skip_ingest && stage == Stage::Ingest {
            info!("Skipping ingestion");
            continue;
        }
        runs.push(run_logged(config, &run_id, stage).await?);
    }

    info!(run_id = %run_id, stages = runs.len(), "Pipeline complete");
    Ok(runs)
}

/// Runs one stage with the same audit logging as [`run_all`].
pub async fn run_single(config: &PipelineConfig, stage: Stage) -> Result<StageRun> {
    config.validate()?;
    config.layout().create_directories()?;
    let run_id = Utc::now().format("%Y%m%dT%H%M%S%.3f").to_string();
    run_logged(config, &run_id, stage).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    #[test]
    fn test_stage_order() {
        let names: Vec<&str> = Stage::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            vec!["ingest", "unify", "clean", "impute", "zones", "aggregate", "weather"]
        );
    }

    #[tokio::test]
    async fn test_failed_stage_is_logged_and_stops_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let err = run_single(&config, Stage::Zones).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingUpstream { stage: "zones", .. })
        ));

        let log = std::fs::read_to_string(config.layout().audit_dir.join(PIPELINE_RUNS_FILE)).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("run_id,stage,started_at"));
        assert!(lines[1].contains(",zones,"));
        assert!(lines[1].contains(",failed,"));
    }
}
