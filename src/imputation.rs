//! Gap imputation.
//!
//! A declared gap month is filled with daily statistics blended from the
//! same month in reference periods:
//!
//! `imputed(day) = Σ wᵢ · sourceᵢ(day)` with `Σ wᵢ = 1`
//!
//! Only aggregates are produced; no synthetic trips are generated.

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use datafusion::arrow::array::{
    ArrayRef, Date32Array, Float64Array, Int32Array, Int64Array, StringArray,
};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::prelude::SessionContext;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::cleaning::detect::CLEAN_TAG;
use crate::config::{ImputationTarget, PipelineConfig, WeightedSource};
use crate::engine::{self, columns};
use crate::error::{PipelineError, require_upstream};
use crate::model::{Period, TaxiType, stage_file_name};
use crate::output;
use crate::schema::UNIFIED_TAG;

/// Daily statistics of one reference period.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyStats {
    pub trip_count: f64,
    pub avg_fare: Option<f64>,
    pub avg_total: Option<f64>,
    pub avg_distance: Option<f64>,
    pub avg_congestion: Option<f64>,
    pub typical_pickup: Option<i32>,
    pub typical_dropoff: Option<i32>,
}

/// One imputed day of the gap month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImputedDay {
    pub date: NaiveDate,
    pub day_of_month: u32,
    pub imputed_trip_count: i64,
    pub imputed_avg_fare: Option<f64>,
    pub imputed_avg_total: Option<f64>,
    pub imputed_avg_distance: Option<f64>,
    pub imputed_avg_congestion: Option<f64>,
    pub typical_pickup: Option<i32>,
    pub typical_dropoff: Option<i32>,
}

/// Scales weights so they sum to 1.
pub fn normalize_weights(sources: &[WeightedSource]) -> Vec<f64> {
    let total: f64 = sources.iter().map(|s| s.weight).sum();
    sources.iter().map(|s| s.weight / total).collect()
}

fn blend_value(parts: &[(f64, Option<f64>)]) -> Option<f64> {
    parts
        .iter()
        .map(|(w, v)| v.map(|v| w * v))
        .sum::<Option<f64>>()
}

/// Blends per-day source statistics into the days of `target`.
///
/// `sources` pairs each normalized weight with that period's stats keyed by
/// day of month. Only days present in every source and valid in `target`
/// are imputed. Modal zones come from the heaviest source.
pub fn blend(target: Period, sources: &[(f64, BTreeMap<u32, DailyStats>)]) -> Vec<ImputedDay> {
    let Some((_, first)) = sources.first() else {
        return Vec::new();
    };
    let heaviest = sources
        .iter()
        .enumerate()
        .max_by(|(ia, (wa, _)), (ib, (wb, _))| wa.total_cmp(wb).then(ia.cmp(ib)))
        .map(|(i, _)| i)
        .unwrap_or(0);

    let mut days = Vec::new();
    for &day in first.keys() {
        let Some(date) = target.date(day) else {
            continue;
        };
        let Some(stats): Option<Vec<(f64, &DailyStats)>> = sources
            .iter()
            .map(|(w, by_day)| by_day.get(&day).map(|s| (*w, s)))
            .collect()
        else {
            continue;
        };

        let pick = |f: fn(&DailyStats) -> Option<f64>| -> Option<f64> {
            blend_value(&stats.iter().map(|(w, s)| (*w, f(s))).collect::<Vec<_>>())
        };
        let trips: f64 = stats.iter().map(|(w, s)| w * s.trip_count).sum();
        let modal = stats[heaviest].1;

        days.push(ImputedDay {
            date,
            day_of_month: day,
            imputed_trip_count: trips.round() as i64,
            imputed_avg_fare: pick(|s| s.avg_fare),
            imputed_avg_total: pick(|s| s.avg_total),
            imputed_avg_distance: pick(|s| s.avg_distance),
            imputed_avg_congestion: pick(|s| s.avg_congestion),
            typical_pickup: modal.typical_pickup,
            typical_dropoff: modal.typical_dropoff,
        });
    }
    days
}

fn period_bounds(period: Period) -> (String, String) {
    let start = period.first_day();
    let end = start + chrono::Duration::days(period.days_in_month() as i64);
    (
        format!("CAST('{}T00:00:00' AS TIMESTAMP)", start),
        format!("CAST('{}T00:00:00' AS TIMESTAMP)", end),
    )
}

fn modal_zone_sql(column: &str) -> String {
    format!(
        "SELECT day_of_month, zone_id FROM (
             SELECT day_of_month, zone_id,
                    ROW_NUMBER() OVER (PARTITION BY day_of_month ORDER BY n DESC, zone_id) AS rn
             FROM (SELECT day_of_month, {column} AS zone_id, COUNT(*) AS n
                   FROM source_days GROUP BY day_of_month, {column}) counts
         ) ranked
         WHERE rn = 1"
    )
}

async fn collect_modal(ctx: &SessionContext, column: &str) -> Result<BTreeMap<u32, i32>> {
    let batches = ctx.sql(&modal_zone_sql(column)).await?.collect().await?;
    let days = columns::gather(&batches, "day_of_month", columns::i64s)?;
    let zones = columns::gather(&batches, "zone_id", columns::i64s)?;
    Ok(days
        .into_iter()
        .zip(zones)
        .filter_map(|(d, z)| Some((u32::try_from(d?).ok()?, z? as i32)))
        .collect())
}

/// Daily statistics of one trip table, restricted to pickups inside `period`.
pub async fn daily_stats(
    ctx: &SessionContext,
    table: &Path,
    period: Period,
) -> Result<BTreeMap<u32, DailyStats>> {
    engine::register_parquet_files(ctx, "source_trips", &[table.to_path_buf()]).await?;
    let (start, end) = period_bounds(period);
    engine::register_view(
        ctx,
        "source_days",
        &format!(
            "SELECT CAST(date_part('day', pickup_time) AS BIGINT) AS day_of_month, *
             FROM source_trips
             WHERE pickup_time >= {start} AND pickup_time < {end}"
        ),
    )
    .await?;

    let batches = ctx
        .sql(
            "SELECT day_of_month,
                    COUNT(*) AS trip_count,
                    AVG(fare) AS avg_fare,
                    AVG(total_amount) AS avg_total,
                    AVG(trip_distance) AS avg_distance,
                    AVG(COALESCE(congestion_surcharge, 0)) AS avg_congestion
             FROM source_days
             GROUP BY day_of_month",
        )
        .await?
        .collect()
        .await?;
    let pickups = collect_modal(ctx, "pickup_loc").await?;
    let dropoffs = collect_modal(ctx, "dropoff_loc").await?;

    ctx.deregister_table("source_days")?;
    ctx.deregister_table("source_trips")?;

    let mut stats = BTreeMap::new();
    for batch in &batches {
        let day = columns::i64s(batch, "day_of_month")?;
        let count = columns::i64s(batch, "trip_count")?;
        let fare = columns::f64s(batch, "avg_fare")?;
        let total = columns::f64s(batch, "avg_total")?;
        let distance = columns::f64s(batch, "avg_distance")?;
        let congestion = columns::f64s(batch, "avg_congestion")?;
        for i in 0..batch.num_rows() {
            let Some(day) = day[i].and_then(|d| u32::try_from(d).ok()) else {
                continue;
            };
            stats.insert(
                day,
                DailyStats {
                    trip_count: count[i].unwrap_or(0) as f64,
                    avg_fare: fare[i],
                    avg_total: total[i],
                    avg_distance: distance[i],
                    avg_congestion: congestion[i],
                    typical_pickup: pickups.get(&day).copied(),
                    typical_dropoff: dropoffs.get(&day).copied(),
                },
            );
        }
    }
    Ok(stats)
}

/// Column name for a source weight, e.g. `weight_2024_12`.
pub fn weight_column(period: Period) -> String {
    format!("weight_{}_{:02}", period.year, period.month)
}

fn days_to_batch(
    taxi_type: TaxiType,
    days: &[ImputedDay],
    sources: &[WeightedSource],
    weights: &[f64],
) -> Result<RecordBatch> {
    let epoch = NaiveDate::default(); // 1970-01-01
    let n = days.len();

    let mut fields = vec![
        Field::new("trip_date", DataType::Date32, false),
        Field::new("day_of_month", DataType::Int64, false),
        Field::new("imputed_trip_count", DataType::Int64, false),
        Field::new("imputed_avg_fare", DataType::Float64, true),
        Field::new("imputed_avg_total", DataType::Float64, true),
        Field::new("imputed_avg_distance", DataType::Float64, true),
        Field::new("imputed_avg_congestion", DataType::Float64, true),
        Field::new("typical_pickup", DataType::Int32, true),
        Field::new("typical_dropoff", DataType::Int32, true),
    ];
    let mut arrays: Vec<ArrayRef> = vec![
        Arc::new(Date32Array::from(
            days.iter()
                .map(|d| (d.date - epoch).num_days() as i32)
                .collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            days.iter().map(|d| d.day_of_month as i64).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            days.iter().map(|d| d.imputed_trip_count).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            days.iter().map(|d| d.imputed_avg_fare).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            days.iter().map(|d| d.imputed_avg_total).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            days.iter().map(|d| d.imputed_avg_distance).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            days.iter().map(|d| d.imputed_avg_congestion).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            days.iter().map(|d| d.typical_pickup).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            days.iter().map(|d| d.typical_dropoff).collect::<Vec<_>>(),
        )),
    ];

    for (source, weight) in sources.iter().zip(weights) {
        fields.push(Field::new(weight_column(source.period), DataType::Float64, false));
        arrays.push(Arc::new(Float64Array::from(vec![*weight; n])));
    }

    fields.push(Field::new("taxi_type", DataType::Utf8, false));
    arrays.push(Arc::new(StringArray::from(vec![taxi_type.as_str(); n])));
    fields.push(Field::new("data_source", DataType::Utf8, false));
    arrays.push(Arc::new(StringArray::from(vec!["IMPUTED"; n])));

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

#[derive(Debug, Serialize)]
struct SourceNote {
    period: Period,
    weight: f64,
    normalized_weight: f64,
    days_available: usize,
}

/// Documents how a gap was filled, written beside the imputed table.
#[derive(Debug, Serialize)]
struct ImputationNote {
    taxi_type: TaxiType,
    target: Period,
    method: &'static str,
    generated_at: String,
    sources: Vec<SourceNote>,
    imputed_days: usize,
    imputed_trips: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImputationOutcome {
    pub taxi_type: TaxiType,
    pub target: Period,
    pub imputed: bool,
    pub days: usize,
    pub trips: i64,
    pub output: Option<PathBuf>,
}

pub fn imputed_file_name(taxi_type: TaxiType, target: Period) -> String {
    format!("{taxi_type}_imputed_{target}_daily.parquet")
}

fn target_present(config: &PipelineConfig, taxi_type: TaxiType, target: Period) -> bool {
    let layout = config.layout();
    layout
        .unified_dir
        .join(stage_file_name(taxi_type, UNIFIED_TAG, target))
        .exists()
        || layout
            .clean_dir
            .join(stage_file_name(taxi_type, CLEAN_TAG, target))
            .exists()
}

/// Imputes one gap for one taxi type from the clean reference tables.
#[tracing::instrument(skip_all, fields(taxi_type = %taxi_type, target = %target.period))]
pub async fn impute_gap(
    ctx: &SessionContext,
    config: &PipelineConfig,
    taxi_type: TaxiType,
    target: &ImputationTarget,
) -> Result<ImputationOutcome> {
    let layout = config.layout();
    let weights = normalize_weights(&target.sources);

    let mut per_source = Vec::new();
    for (source, weight) in target.sources.iter().zip(&weights) {
        let table = layout
            .clean_dir
            .join(stage_file_name(taxi_type, CLEAN_TAG, source.period));
        require_upstream("impute", &table)?;
        let stats = daily_stats(ctx, &table, source.period).await?;
        per_source.push((*weight, stats));
    }

    let days = blend(target.period, &per_source);
    let trips: i64 = days.iter().map(|d| d.imputed_trip_count).sum();

    let output = layout
        .imputed_dir
        .join(imputed_file_name(taxi_type, target.period));
    let batch = days_to_batch(taxi_type, &days, &target.sources, &weights)?;
    engine::write_parquet(ctx.read_batch(batch)?, &output).await?;

    let note = ImputationNote {
        taxi_type,
        target: target.period,
        method: "weighted_average",
        generated_at: Utc::now().to_rfc3339(),
        sources: target
            .sources
            .iter()
            .zip(&weights)
            .zip(&per_source)
            .map(|((s, w), (_, stats))| SourceNote {
                period: s.period,
                weight: s.weight,
                normalized_weight: *w,
                days_available: stats.len(),
            })
            .collect(),
        imputed_days: days.len(),
        imputed_trips: trips,
    };
    output::write_json(&output.with_extension("json"), &note)?;

    info!(days = days.len(), trips, output = %output.display(), "Gap imputed");
    Ok(ImputationOutcome {
        taxi_type,
        target: target.period,
        imputed: true,
        days: days.len(),
        trips,
        output: Some(output),
    })
}

/// Fills every configured gap that is still absent.
#[tracing::instrument(skip_all, fields(targets = config.imputation.len()))]
pub async fn impute_all(config: &PipelineConfig) -> Result<Vec<ImputationOutcome>> {
    let layout = config.layout();
    require_upstream("impute", &layout.clean_dir)?;
    let ctx = engine::session(&config.engine)?;

    let mut outcomes = Vec::new();
    for target in &config.imputation {
        if target.sources.is_empty() {
            return Err(PipelineError::InvalidConfig(format!(
                "imputation target {} has no sources",
                target.period
            ))
            .into());
        }
        for taxi_type in TaxiType::ALL {
            if target_present(config, taxi_type, target.period) {
                info!(taxi_type = %taxi_type, target = %target.period, "Target period present, no imputation needed");
                outcomes.push(ImputationOutcome {
                    taxi_type,
                    target: target.period,
                    imputed: false,
                    days: 0,
                    trips: 0,
                    output: None,
                });
                continue;
            }
            outcomes.push(impute_gap(&ctx, config, taxi_type, target).await?);
        }
    }
    Ok(outcomes)
}
