//! Weather join.
//!
//! Daily weather observations (Meteostat column order, optionally gzipped)
//! are left-joined onto daily trip totals, and the effect of rain and
//! temperature on demand is summarized.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use datafusion::arrow::array::{ArrayRef, Date32Array, Float64Array};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::arrow::record_batch::RecordBatch;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::analysis::daily::CATEGORY_FILE;
use crate::analysis::utility::{mean, pct_change, pearson};
use crate::config::PipelineConfig;
use crate::engine::{self, columns};
use crate::error::require_upstream;
use crate::output;

pub const WEATHER_JOINED_FILE: &str = "weather_joined.parquet";
pub const WEATHER_SUMMARY_FILE: &str = "weather_summary.json";

/// One day of weather, in Meteostat column order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    #[serde(default)]
    pub tavg: Option<f64>,
    #[serde(default)]
    pub tmin: Option<f64>,
    #[serde(default)]
    pub tmax: Option<f64>,
    #[serde(default)]
    pub prcp: Option<f64>,
    #[serde(default)]
    pub snow: Option<f64>,
    #[serde(default)]
    pub wdir: Option<f64>,
    #[serde(default)]
    pub wspd: Option<f64>,
    #[serde(default)]
    pub wpgt: Option<f64>,
    #[serde(default)]
    pub pres: Option<f64>,
    #[serde(default)]
    pub tsun: Option<f64>,
}

fn open(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).with_context(|| format!("opening weather file {}", path.display()))?;
    if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Reads daily observations. A header row is detected and skipped.
pub fn load_observations(path: &Path) -> Result<Vec<Observation>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(open(path)?);

    let mut observations = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        let first = record.get(0).unwrap_or_default().trim();
        if i == 0 && NaiveDate::parse_from_str(first, "%Y-%m-%d").is_err() {
            continue;
        }
        let observation: Observation = record
            .deserialize(None)
            .with_context(|| format!("parsing weather row {} of {}", i + 1, path.display()))?;
        observations.push(observation);
    }
    Ok(observations)
}

fn observations_to_batch(observations: &[Observation]) -> Result<RecordBatch> {
    let epoch = NaiveDate::default(); // 1970-01-01
    let value_fields: [(&str, fn(&Observation) -> Option<f64>); 10] = [
        ("tavg", |o| o.tavg),
        ("tmin", |o| o.tmin),
        ("tmax", |o| o.tmax),
        ("prcp", |o| o.prcp),
        ("snow", |o| o.snow),
        ("wdir", |o| o.wdir),
        ("wspd", |o| o.wspd),
        ("wpgt", |o| o.wpgt),
        ("pres", |o| o.pres),
        ("tsun", |o| o.tsun),
    ];

    let mut fields = vec![Field::new("weather_date", DataType::Date32, false)];
    let mut arrays: Vec<ArrayRef> = vec![Arc::new(Date32Array::from(
        observations
            .iter()
            .map(|o| (o.date - epoch).num_days() as i32)
            .collect::<Vec<_>>(),
    ))];
    for (name, value) in value_fields {
        fields.push(Field::new(name, DataType::Float64, true));
        arrays.push(Arc::new(Float64Array::from(
            observations.iter().map(value).collect::<Vec<_>>(),
        )));
    }
    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

/// One joined day, as read back for the summary.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedDay {
    pub total_trips: f64,
    pub tavg: Option<f64>,
    pub prcp_filled: f64,
    pub is_rainy_day: bool,
    pub has_weather: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeatherSummary {
    pub days: usize,
    pub days_with_weather: usize,
    pub rainy_day_threshold_mm: f64,
    pub rainy_days: usize,
    pub dry_days: usize,
    pub corr_trips_precipitation: Option<f64>,
    pub corr_trips_temperature: Option<f64>,
    pub avg_trips_rainy: Option<f64>,
    pub avg_trips_dry: Option<f64>,
    /// Percentage change in average daily trips on rainy days vs dry days.
    pub rain_effect_pct: Option<f64>,
}

pub fn summarize(days: &[JoinedDay], threshold_mm: f64) -> WeatherSummary {
    let trips: Vec<f64> = days.iter().map(|d| d.total_trips).collect();
    let prcp: Vec<f64> = days.iter().map(|d| d.prcp_filled).collect();
    let (temp_trips, temps): (Vec<f64>, Vec<f64>) = days
        .iter()
        .filter_map(|d| d.tavg.map(|t| (d.total_trips, t)))
        .unzip();

    let rainy: Vec<f64> = days.iter().filter(|d| d.is_rainy_day).map(|d| d.total_trips).collect();
    let dry: Vec<f64> = days.iter().filter(|d| !d.is_rainy_day).map(|d| d.total_trips).collect();
    let avg = |v: &[f64]| (!v.is_empty()).then(|| mean(v));
    let (avg_trips_rainy, avg_trips_dry) = (avg(&rainy), avg(&dry));

    WeatherSummary {
        days: days.len(),
        days_with_weather: days.iter().filter(|d| d.has_weather).count(),
        rainy_day_threshold_mm: threshold_mm,
        rainy_days: rainy.len(),
        dry_days: dry.len(),
        corr_trips_precipitation: pearson(&trips, &prcp),
        corr_trips_temperature: pearson(&temp_trips, &temps),
        avg_trips_rainy,
        avg_trips_dry,
        rain_effect_pct: match (avg_trips_rainy, avg_trips_dry) {
            (Some(r), Some(d)) => pct_change(d, r),
            _ => None,
        },
    }
}

/// Joins weather onto daily zone trip totals and writes both outputs.
#[tracing::instrument(skip_all)]
pub async fn join_weather(config: &PipelineConfig) -> Result<WeatherSummary> {
    let layout = config.layout();
    let categories = layout.aggregated(CATEGORY_FILE);
    require_upstream("weather", &categories)?;
    require_upstream("weather", &layout.weather_file)?;

    let observations = load_observations(&layout.weather_file)?;
    if observations.is_empty() {
        warn!(path = %layout.weather_file.display(), "Weather file has no observations");
    }
    info!(days = observations.len(), "Weather observations loaded");

    let ctx = engine::session(&config.engine)?;
    ctx.register_table("weather", ctx.read_batch(observations_to_batch(&observations)?)?.into_view())?;
    engine::register_parquet_files(&ctx, "zone_categories", &[categories]).await?;
    engine::register_view(
        &ctx,
        "daily_trips",
        "SELECT trip_date,
                SUM(trip_count) AS total_trips,
                SUM(avg_fare * trip_count) / SUM(CASE WHEN avg_fare IS NULL THEN 0 ELSE trip_count END)
                    AS avg_fare,
                SUM(total_congestion_collected) AS congestion_revenue
         FROM zone_categories
         GROUP BY trip_date",
    )
    .await?;

    let threshold = config.weather.rainy_day_threshold_mm;
    let output = layout.aggregated(WEATHER_JOINED_FILE);
    let rows = engine::copy_to_parquet(
        &ctx,
        &format!(
            "SELECT t.trip_date, t.total_trips, t.avg_fare, t.congestion_revenue,
                    w.tavg, w.tmin, w.tmax, w.prcp, w.snow, w.wdir, w.wspd, w.wpgt, w.pres, w.tsun,
                    w.weather_date IS NOT NULL AS has_weather,
                    COALESCE(w.prcp, 0) AS prcp_filled,
                    COALESCE(w.prcp, 0) > {threshold:?} AS is_rainy_day
             FROM daily_trips t
             LEFT JOIN weather w ON t.trip_date = w.weather_date
             ORDER BY t.trip_date"
        ),
        &output,
    )
    .await?;

    let batches = engine::read_parquet_files(&ctx, &[output.clone()])
        .await?
        .collect()
        .await?;
    let mut days = Vec::with_capacity(rows);
    for batch in &batches {
        let trips = columns::f64s(batch, "total_trips")?;
        let tavg = columns::f64s(batch, "tavg")?;
        let prcp = columns::f64s(batch, "prcp_filled")?;
        let rainy = columns::i64s(batch, "is_rainy_day")?;
        let has_weather = columns::i64s(batch, "has_weather")?;
        for i in 0..batch.num_rows() {
            days.push(JoinedDay {
                total_trips: trips[i].unwrap_or(0.0),
                tavg: tavg[i],
                prcp_filled: prcp[i].unwrap_or(0.0),
                is_rainy_day: rainy[i] == Some(1),
                has_weather: has_weather[i] == Some(1),
            });
        }
    }

    let summary = summarize(&days, threshold);
    output::write_json(&layout.aggregated(WEATHER_SUMMARY_FILE), &summary)?;

    info!(
        days = summary.days,
        days_with_weather = summary.days_with_weather,
        corr_precipitation = ?summary.corr_trips_precipitation,
        corr_temperature = ?summary.corr_trips_temperature,
        rain_effect_pct = ?summary.rain_effect_pct,
        "Weather join complete"
    );
    Ok(summary)
}
