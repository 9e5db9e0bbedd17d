use anyhow::Result;
use chrono::Utc;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::prelude::SessionContext;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::rules::{DURATION_SQL, ghost_flag_sql, matched_rules_sql};
use crate::config::{GhostThresholds, PipelineConfig};
use crate::engine::{self, columns, sql_literal};
use crate::error::{PipelineError, require_upstream};
use crate::model::{Period, TaxiType, parse_stage_file_name, stage_file_name};
use crate::output;
use crate::schema::{CANONICAL_COLUMNS, UNIFIED_TAG, verify_unified_schema};

pub const CLEAN_TAG: &str = "clean";
pub const GHOST_TAG: &str = "ghost";

pub const GHOST_SUMMARY_FILE: &str = "ghost_summary.csv";
pub const GHOST_PATTERNS_FILE: &str = "ghost_patterns.json";

/// Aggregate figures for one ghost flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagStats {
    pub ghost_flag: String,
    pub trip_count: i64,
    pub avg_speed_mph: Option<f64>,
    pub avg_fare: Option<f64>,
    pub avg_distance: Option<f64>,
    pub avg_duration_secs: Option<f64>,
}

/// Outcome of splitting one unified table.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    pub taxi_type: TaxiType,
    pub period: Period,
    pub total_rows: usize,
    pub clean_rows: usize,
    pub ghost_rows: usize,
    pub flags: Vec<FlagStats>,
}

impl DetectionReport {
    pub fn ghost_rate(&self) -> f64 {
        if self.total_rows == 0 {
            return 0.0;
        }
        self.ghost_rows as f64 / self.total_rows as f64 * 100.0
    }
}

/// One row of `ghost_summary.csv`: a file's totals repeated per flag.
#[derive(Debug, Serialize)]
struct GhostSummaryRow<'a> {
    recorded_at: String,
    taxi_type: TaxiType,
    period: Period,
    total_rows: usize,
    clean_rows: usize,
    ghost_rows: usize,
    ghost_flag: &'a str,
    flag_count: i64,
    avg_speed_mph: Option<f64>,
    avg_fare: Option<f64>,
    avg_distance: Option<f64>,
}

fn canonical_select() -> String {
    CANONICAL_COLUMNS
        .iter()
        .chain(std::iter::once(&"taxi_type"))
        .copied()
        .collect::<Vec<_>>()
        .join(", ")
}

/// Splits one unified table into its clean and ghost halves.
#[tracing::instrument(skip(ctx, thresholds), fields(input = %input.display()))]
pub async fn detect_ghost_trips(
    ctx: &SessionContext,
    input: &Path,
    clean_output: &Path,
    ghost_output: &Path,
    thresholds: &GhostThresholds,
    taxi_type: TaxiType,
    period: Period,
) -> Result<DetectionReport> {
    let source_file = input
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    engine::register_parquet_files(ctx, "unified_trips", &[input.to_path_buf()]).await?;
    engine::register_view(
        ctx,
        "scored_trips",
        &format!("SELECT *, {DURATION_SQL} AS duration_seconds FROM unified_trips"),
    )
    .await?;
    engine::register_view(
        ctx,
        "flagged_trips",
        &format!(
            "SELECT *, {} AS ghost_flag, {} AS matched_rules FROM scored_trips",
            ghost_flag_sql(thresholds),
            matched_rules_sql(thresholds)
        ),
    )
    .await?;

    let columns = canonical_select();
    let clean_rows = engine::copy_to_parquet(
        ctx,
        &format!("SELECT {columns} FROM flagged_trips WHERE ghost_flag IS NULL"),
        clean_output,
    )
    .await?;
    let ghost_rows = engine::copy_to_parquet(
        ctx,
        &format!(
            "SELECT {columns}, ghost_flag, matched_rules, duration_seconds,
                    CASE WHEN duration_seconds > 0
                         THEN trip_distance * 3600.0 / duration_seconds END AS speed_mph,
                    {} AS source_file
             FROM flagged_trips
             WHERE ghost_flag IS NOT NULL",
            sql_literal(&source_file)
        ),
        ghost_output,
    )
    .await?;

    for table in ["flagged_trips", "scored_trips", "unified_trips"] {
        ctx.deregister_table(table)?;
    }

    let flags = flag_stats(ctx, &[ghost_output.to_path_buf()]).await?;
    let report = DetectionReport {
        taxi_type,
        period,
        total_rows: clean_rows + ghost_rows,
        clean_rows,
        ghost_rows,
        flags,
    };

    info!(
        total = report.total_rows,
        clean = report.clean_rows,
        ghost = report.ghost_rows,
        ghost_pct = %format!("{:.2}", report.ghost_rate()),
        "Ghost trip detection complete"
    );
    Ok(report)
}

fn read_flag_stats(batches: &[RecordBatch]) -> Result<Vec<FlagStats>> {
    let mut stats = Vec::new();
    for batch in batches {
        let flag = columns::strings(batch, "ghost_flag")?;
        let count = columns::i64s(batch, "trip_count")?;
        let speed = columns::f64s(batch, "avg_speed_mph")?;
        let fare = columns::f64s(batch, "avg_fare")?;
        let distance = columns::f64s(batch, "avg_distance")?;
        let duration = columns::f64s(batch, "avg_duration_secs")?;
        for i in 0..batch.num_rows() {
            stats.push(FlagStats {
                ghost_flag: flag[i].clone().unwrap_or_default(),
                trip_count: count[i].unwrap_or(0),
                avg_speed_mph: speed[i],
                avg_fare: fare[i],
                avg_distance: distance[i],
                avg_duration_secs: duration[i],
            });
        }
    }
    Ok(stats)
}

/// Per-flag figures over a set of ghost audit tables, most frequent first.
pub async fn flag_stats(ctx: &SessionContext, ghost_tables: &[PathBuf]) -> Result<Vec<FlagStats>> {
    engine::register_parquet_files(ctx, "ghost_audit", ghost_tables).await?;
    let batches = ctx
        .sql(
            "SELECT ghost_flag,
                    COUNT(*) AS trip_count,
                    AVG(speed_mph) AS avg_speed_mph,
                    AVG(fare) AS avg_fare,
                    AVG(trip_distance) AS avg_distance,
                    AVG(duration_seconds) AS avg_duration_secs
             FROM ghost_audit
             GROUP BY ghost_flag
             ORDER BY trip_count DESC, ghost_flag",
        )
        .await?
        .collect()
        .await?;
    ctx.deregister_table("ghost_audit")?;
    read_flag_stats(&batches)
}

fn append_summary(path: &Path, report: &DetectionReport) -> Result<()> {
    let recorded_at = Utc::now().to_rfc3339();
    // a file with no ghosts still gets one row so its totals are on record
    let none = FlagStats {
        ghost_flag: String::new(),
        trip_count: 0,
        avg_speed_mph: None,
        avg_fare: None,
        avg_distance: None,
        avg_duration_secs: None,
    };
    let flags: Vec<&FlagStats> = if report.flags.is_empty() {
        vec![&none]
    } else {
        report.flags.iter().collect()
    };

    for flag in flags {
        output::append_record(
            path,
            &GhostSummaryRow {
                recorded_at: recorded_at.clone(),
                taxi_type: report.taxi_type,
                period: report.period,
                total_rows: report.total_rows,
                clean_rows: report.clean_rows,
                ghost_rows: report.ghost_rows,
                ghost_flag: &flag.ghost_flag,
                flag_count: flag.trip_count,
                avg_speed_mph: flag.avg_speed_mph,
                avg_fare: flag.avg_fare,
                avg_distance: flag.avg_distance,
            },
        )?;
    }
    Ok(())
}

/// Runs ghost detection over every unified table.
///
/// Tables whose clean output already exists are reported from disk instead
/// of being recomputed, unless `overwrite` is set.
#[tracing::instrument(skip_all)]
pub async fn clean_all(config: &PipelineConfig) -> Result<Vec<DetectionReport>> {
    let layout = config.layout();
    require_upstream("clean", &layout.unified_dir)?;

    let inputs: Vec<_> = engine::list_parquet(&layout.unified_dir)?
        .into_iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?;
            let (taxi_type, period) = parse_stage_file_name(name, UNIFIED_TAG)?;
            Some((taxi_type, period, path))
        })
        .collect();
    if inputs.is_empty() {
        return Err(PipelineError::MissingUpstream {
            stage: "clean",
            path: layout.unified_dir.clone(),
        }
        .into());
    }

    let ctx = engine::session(&config.engine)?;
    let summary_path = layout.audit_dir.join(GHOST_SUMMARY_FILE);
    let mut reports = Vec::new();

    for (taxi_type, period, input) in inputs {
        let clean_output = layout.clean_dir.join(stage_file_name(taxi_type, CLEAN_TAG, period));
        let ghost_output = layout.ghost_dir.join(stage_file_name(taxi_type, GHOST_TAG, period));

        if clean_output.exists() && ghost_output.exists() && !config.overwrite {
            info!(output = %clean_output.display(), "Already cleaned, skipping");
            let clean_rows = engine::row_count(&ctx, &clean_output).await?;
            let flags = flag_stats(&ctx, &[ghost_output]).await?;
            let ghost_rows = flags.iter().map(|f| f.trip_count as usize).sum();
            reports.push(DetectionReport {
                taxi_type,
                period,
                total_rows: clean_rows + ghost_rows,
                clean_rows,
                ghost_rows,
                flags,
            });
            continue;
        }

        verify_unified_schema(&ctx, &input).await?;
        let report = detect_ghost_trips(
            &ctx,
            &input,
            &clean_output,
            &ghost_output,
            &config.thresholds,
            taxi_type,
            period,
        )
        .await?;
        append_summary(&summary_path, &report)?;
        reports.push(report);
    }

    let total: usize = reports.iter().map(|r| r.total_rows).sum();
    let ghosts: usize = reports.iter().map(|r| r.ghost_rows).sum();
    info!(files = reports.len(), total, ghosts, "Cleaning complete");
    Ok(reports)
}

#[derive(Debug, Clone, Serialize)]
pub struct HourCount {
    pub hour: i64,
    pub trip_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneCount {
    pub zone_id: i64,
    pub trip_count: i64,
}

/// Where and when ghost trips cluster, across every audit table.
#[derive(Debug, Clone, Serialize)]
pub struct GhostPatterns {
    pub total_ghost_trips: i64,
    pub by_flag: Vec<FlagStats>,
    pub by_pickup_hour: Vec<HourCount>,
    pub top_pickup_zones: Vec<ZoneCount>,
}

/// Summarizes every ghost audit table and writes `ghost_patterns.json`.
#[tracing::instrument(skip_all)]
pub async fn analyze_ghost_patterns(config: &PipelineConfig) -> Result<GhostPatterns> {
    let layout = config.layout();
    require_upstream("ghost-patterns", &layout.ghost_dir)?;
    let tables = engine::list_parquet(&layout.ghost_dir)?;
    if tables.is_empty() {
        warn!(dir = %layout.ghost_dir.display(), "No ghost trip tables found");
    }

    let mut patterns = GhostPatterns {
        total_ghost_trips: 0,
        by_flag: Vec::new(),
        by_pickup_hour: Vec::new(),
        top_pickup_zones: Vec::new(),
    };

    if !tables.is_empty() {
        let ctx = engine::session(&config.engine)?;
        patterns.by_flag = flag_stats(&ctx, &tables).await?;
        patterns.total_ghost_trips = patterns.by_flag.iter().map(|f| f.trip_count).sum();

        engine::register_parquet_files(&ctx, "ghost_audit", &tables).await?;
        let hours = ctx
            .sql(
                "SELECT pickup_hour, COUNT(*) AS trip_count
                 FROM (SELECT CAST(date_part('hour', pickup_time) AS BIGINT) AS pickup_hour
                       FROM ghost_audit) hours
                 GROUP BY pickup_hour
                 ORDER BY pickup_hour",
            )
            .await?
            .collect()
            .await?;
        let hour = columns::gather(&hours, "pickup_hour", columns::i64s)?;
        let count = columns::gather(&hours, "trip_count", columns::i64s)?;
        patterns.by_pickup_hour = hour
            .into_iter()
            .zip(count)
            .filter_map(|(h, c)| Some(HourCount { hour: h?, trip_count: c? }))
            .collect();

        let zones = ctx
            .sql(
                "SELECT pickup_loc AS zone_id, COUNT(*) AS trip_count
                 FROM ghost_audit GROUP BY pickup_loc
                 ORDER BY trip_count DESC, zone_id LIMIT 10",
            )
            .await?
            .collect()
            .await?;
        let zone = columns::gather(&zones, "zone_id", columns::i64s)?;
        let count = columns::gather(&zones, "trip_count", columns::i64s)?;
        patterns.top_pickup_zones = zone
            .into_iter()
            .zip(count)
            .filter_map(|(z, c)| Some(ZoneCount { zone_id: z?, trip_count: c? }))
            .collect();
    }

    for flag in &patterns.by_flag {
        info!(
            ghost_flag = %flag.ghost_flag,
            count = flag.trip_count,
            avg_speed_mph = flag.avg_speed_mph.unwrap_or_default(),
            avg_fare = flag.avg_fare.unwrap_or_default(),
            avg_distance = flag.avg_distance.unwrap_or_default(),
            "Ghost pattern"
        );
    }

    output::write_json(&layout.audit_dir.join(GHOST_PATTERNS_FILE), &patterns)?;
    Ok(patterns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaning::rules::GhostRule;
    use crate::config::EngineConfig;
    use crate::model::TripRecord;

    const UNIFIED: &str = "SELECT CAST(column1 AS TIMESTAMP) AS pickup_time,
                CAST(column2 AS TIMESTAMP) AS dropoff_time,
                CAST(column3 AS INT) AS pickup_loc,
                CAST(column4 AS INT) AS dropoff_loc,
                CAST(column5 AS DOUBLE) AS trip_distance,
                CAST(column6 AS DOUBLE) AS fare,
                CAST(column7 AS DOUBLE) AS total_amount,
                CAST(column8 AS DOUBLE) AS congestion_surcharge,
                'yellow' AS taxi_type
         FROM (VALUES
            ('2025-01-06T08:00:00', '2025-01-06T08:15:00', 161, 236, 3.0, 18.0, 24.0, 2.5),
            ('2025-01-06T09:00:00', '2025-01-06T09:05:00', 161, 236, 10.0, 15.0, 20.0, 2.5),
            ('2025-01-06T10:00:00', '2025-01-06T10:00:30', 4, 13, 0.3, 25.0, 30.0, 0.0),
            ('2025-01-06T11:00:00', '2025-01-06T10:58:00', 4, 13, 1.0, 10.0, 12.0, 0.0),
            ('2025-01-06T12:00:00', '2025-01-06T12:20:00', 43, 48, 2.0, -5.0, -2.0, 0.0),
            ('2025-01-06T13:00:00', '2025-01-06T13:10:00', 43, 48, 0.0, 7.0, 9.0, 0.0),
            ('2025-01-06T14:00:00', '2025-01-06T14:30:00', 87, 90, 5.0, 22.0, 28.0, 2.5),
            ('2025-01-06T15:00:00', '2025-01-06T15:00:30', 4, 13, 5.0, 25.0, 30.0, 0.0),
            ('2025-01-06T16:00:00', '2025-01-06T16:20:00', 87, 90, NULL, 14.0, 18.0, 2.5))";

    #[tokio::test]
    async fn test_detect_splits_and_tags_first_rule() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = engine::session(&EngineConfig::default()).unwrap();
        let input = dir.path().join("yellow_unified_2025-01.parquet");
        engine::copy_to_parquet(&ctx, UNIFIED, &input).await.unwrap();

        let clean = dir.path().join("clean.parquet");
        let ghost = dir.path().join("ghost.parquet");
        let thresholds = GhostThresholds::default();
        let report = detect_ghost_trips(
            &ctx,
            &input,
            &clean,
            &ghost,
            &thresholds,
            TaxiType::Yellow,
            Period { year: 2025, month: 1 },
        )
        .await
        .unwrap();

        assert_eq!(report.total_rows, 9);
        assert_eq!(report.clean_rows, 3);
        assert_eq!(report.ghost_rows, 6);
        assert_eq!(report.flags.len(), 5);
        for flag in &report.flags {
            let expected = if flag.ghost_flag == "excessive_speed" { 2 } else { 1 };
            assert_eq!(flag.trip_count, expected, "{}", flag.ghost_flag);
        }

        // clean rows satisfy no rule, a NULL distance included
        let batches = engine::read_parquet_files(&ctx, &[clean]).await.unwrap().collect().await.unwrap();
        let records = TripRecord::from_batches(&batches).unwrap();
        assert!(records.iter().any(|r| r.trip_distance.is_none()));
        for record in records {
            assert_eq!(GhostRule::first_match(&record, &thresholds), None);
        }

        // ghost rows carry the first matching rule
        let batches = engine::read_parquet_files(&ctx, &[ghost]).await.unwrap().collect().await.unwrap();
        let records = TripRecord::from_batches(&batches).unwrap();
        let flags = columns::gather(&batches, "ghost_flag", columns::strings).unwrap();
        let matched = columns::gather(&batches, "matched_rules", columns::strings).unwrap();
        let sources = columns::gather(&batches, "source_file", columns::strings).unwrap();
        for ((record, flag), rules) in records.iter().zip(flags).zip(matched) {
            let expected = GhostRule::first_match(record, &thresholds).unwrap();
            assert_eq!(flag.as_deref(), Some(expected.as_str()));

            let all: Vec<&str> = GhostRule::all_matches(record, &thresholds)
                .iter()
                .map(|r| r.as_str())
                .collect();
            assert_eq!(rules, Some(all.join(",")));
        }
        // 5 miles in 30 seconds with a 25.00 fare breaks two rules
        let double = records
            .iter()
            .position(|r| r.pickup_time.format("%H:%M").to_string() == "15:00")
            .unwrap();
        let matched = columns::gather(&batches, "matched_rules", columns::strings).unwrap();
        assert_eq!(
            matched[double].as_deref(),
            Some("excessive_speed,short_trip_high_fare")
        );
        assert!(sources.iter().all(|s| s.as_deref() == Some("yellow_unified_2025-01.parquet")));
    }

    #[tokio::test]
    async fn test_clean_all_requires_unified_tables() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let err = clean_all(&config).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingUpstream { stage: "clean", .. })
        ));
    }

    #[tokio::test]
    async fn test_clean_all_appends_summary_and_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let layout = config.layout();
        let ctx = engine::session(&config.engine).unwrap();
        let input = layout
            .unified_dir
            .join(stage_file_name(TaxiType::Yellow, UNIFIED_TAG, Period { year: 2025, month: 1 }));
        engine::copy_to_parquet(&ctx, UNIFIED, &input).await.unwrap();

        let reports = clean_all(&config).await.unwrap();
        assert_eq!(reports.len(), 1);
        let summary = std::fs::read_to_string(layout.audit_dir.join(GHOST_SUMMARY_FILE)).unwrap();
        // header plus one row per flag
        assert_eq!(summary.lines().count(), 6);

        // second run reads the existing outputs back
        let again = clean_all(&config).await.unwrap();
        assert_eq!(again[0].ghost_rows, 6);
        assert_eq!(again[0].clean_rows, 3);

        let patterns = analyze_ghost_patterns(&config).await.unwrap();
        assert_eq!(patterns.total_ghost_trips, 6);
        assert_eq!(patterns.by_pickup_hour.len(), 6);
        assert!(layout.audit_dir.join(GHOST_PATTERNS_FILE).exists());
    }

    #[tokio::test]
    async fn test_clean_all_rejects_foreign_unified_table() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let layout = config.layout();
        let ctx = engine::session(&config.engine).unwrap();
        let input = layout
            .unified_dir
            .join(stage_file_name(TaxiType::Yellow, UNIFIED_TAG, Period { year: 2025, month: 2 }));
        engine::copy_to_parquet(
            &ctx,
            "SELECT CAST(column1 AS TIMESTAMP) AS pickup_time, CAST(column2 AS DOUBLE) AS fare \
             FROM (VALUES ('2025-02-03T08:00:00', 12.0))",
            &input,
        )
        .await
        .unwrap();

        let err = clean_all(&config).await.unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::MissingColumn { column, path }) => {
                assert_eq!(column, "dropoff_time");
                assert_eq!(path, &input);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(engine::list_parquet(&layout.clean_dir).unwrap().is_empty());
    }
}
