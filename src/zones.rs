//! Congestion-zone filtering.
//!
//! Clean trips that touch the congestion zone are written to one table,
//! tagged with how they relate to the zone and whether they happened after
//! pricing started.

use anyhow::{Context, Result};
use datafusion::prelude::SessionContext;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use tracing::info;

use crate::cleaning::detect::CLEAN_TAG;
use crate::config::{PipelineConfig, ZoneConfig};
use crate::engine::{self, columns};
use crate::error::{PipelineError, require_upstream};
use crate::model::parse_stage_file_name;
use crate::output;

pub const CONGESTION_ZONES_FILE: &str = "congestion_zones.json";

/// One row of the taxi zone lookup table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    #[serde(rename = "LocationID")]
    pub location_id: i32,
    #[serde(rename = "Borough")]
    pub borough: String,
    #[serde(rename = "Zone")]
    pub zone: String,
    pub service_zone: String,
}

#[derive(Debug, Clone, Default)]
pub struct ZoneLookup {
    zones: BTreeMap<i32, Zone>,
}

impl ZoneLookup {
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("opening zone lookup {}", path.display()))?;
        let mut zones = BTreeMap::new();
        for row in reader.deserialize() {
            let zone: Zone = row.with_context(|| format!("parsing zone lookup {}", path.display()))?;
            zones.insert(zone.location_id, zone);
        }
        Ok(Self { zones })
    }

    pub fn get(&self, id: i32) -> Option<&Zone> {
        self.zones.get(&id)
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// The congestion zone set: explicit ids when configured, otherwise
    /// zones in the configured borough whose name contains a keyword
    /// (case-insensitive).
    pub fn congestion_zone_ids(&self, config: &ZoneConfig) -> BTreeSet<i32> {
        if let Some(ids) = &config.zone_ids {
            return ids.iter().copied().collect();
        }
        let keywords: Vec<String> = config.keywords.iter().map(|k| k.to_lowercase()).collect();
        self.zones
            .values()
            .filter(|z| z.borough.eq_ignore_ascii_case(&config.borough))
            .filter(|z| {
                let name = z.zone.to_lowercase();
                keywords.iter().any(|k| name.contains(k.as_str()))
            })
            .map(|z| z.location_id)
            .collect()
    }
}

/// How a trip relates to the congestion zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneCategory {
    InsideZone,
    EnteringZone,
    ExitingZone,
    OutsideZone,
}

impl ZoneCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneCategory::InsideZone => "inside_zone",
            ZoneCategory::EnteringZone => "entering_zone",
            ZoneCategory::ExitingZone => "exiting_zone",
            ZoneCategory::OutsideZone => "outside_zone",
        }
    }
}

impl fmt::Display for ZoneCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn id_list(ids: &BTreeSet<i32>) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ")
}

/// SQL `CASE` naming the zone category of each row.
pub fn zone_category_sql(ids: &BTreeSet<i32>) -> String {
    let list = id_list(ids);
    format!(
        "CASE
            WHEN pickup_loc IN ({list}) AND dropoff_loc IN ({list}) THEN '{}'
            WHEN pickup_loc NOT IN ({list}) AND dropoff_loc IN ({list}) THEN '{}'
            WHEN pickup_loc IN ({list}) AND dropoff_loc NOT IN ({list}) THEN '{}'
            ELSE '{}'
         END",
        ZoneCategory::InsideZone,
        ZoneCategory::EnteringZone,
        ZoneCategory::ExitingZone,
        ZoneCategory::OutsideZone,
    )
}

/// SQL predicate selecting rows that touch the zone.
pub fn touches_zone_sql(ids: &BTreeSet<i32>) -> String {
    let list = id_list(ids);
    format!("(pickup_loc IN ({list}) OR dropoff_loc IN ({list}))")
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryCount {
    pub zone_category: String,
    pub after_congestion_start: bool,
    pub trip_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneFilterReport {
    pub zone_ids: Vec<i32>,
    pub rows: usize,
    pub categories: Vec<CategoryCount>,
}

async fn category_counts(ctx: &SessionContext, zone_trips: &Path) -> Result<Vec<CategoryCount>> {
    engine::register_parquet_files(ctx, "zone_trips", &[zone_trips.to_path_buf()]).await?;
    let batches = ctx
        .sql(
            "SELECT zone_category, after_congestion_start, COUNT(*) AS trip_count
             FROM zone_trips
             GROUP BY zone_category, after_congestion_start
             ORDER BY zone_category, after_congestion_start",
        )
        .await?
        .collect()
        .await?;
    ctx.deregister_table("zone_trips")?;

    let mut counts = Vec::new();
    for batch in &batches {
        let category = columns::strings(batch, "zone_category")?;
        // booleans widen to 0/1
        let after = columns::i64s(batch, "after_congestion_start")?;
        let count = columns::i64s(batch, "trip_count")?;
        for i in 0..batch.num_rows() {
            counts.push(CategoryCount {
                zone_category: category[i].clone().unwrap_or_default(),
                after_congestion_start: after[i] == Some(1),
                trip_count: count[i].unwrap_or(0),
            });
        }
    }
    Ok(counts)
}

/// Writes `zone_trips.parquet` from every clean table.
#[tracing::instrument(skip_all)]
pub async fn filter_zone_trips(config: &PipelineConfig) -> Result<ZoneFilterReport> {
    let layout = config.layout();
    require_upstream("zones", &layout.clean_dir)?;
    require_upstream("zones", &layout.zone_lookup)?;

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
            stage: "zones",
            path: layout.clean_dir.clone(),
        }
        .into());
    }

    let lookup = ZoneLookup::load(&layout.zone_lookup)?;
    if lookup.is_empty() {
        return Err(PipelineError::EmptySource(layout.zone_lookup.clone()).into());
    }
    let ids = lookup.congestion_zone_ids(&config.zones);
    if ids.is_empty() {
        return Err(PipelineError::InvalidConfig(
            "congestion zone set is empty; set zones.zone_ids or adjust zones.keywords".into(),
        )
        .into());
    }
    info!(zones = ids.len(), lookup_rows = lookup.len(), "Congestion zone identified");

    let zone_list: Vec<&Zone> = ids.iter().filter_map(|id| lookup.get(*id)).collect();
    output::write_json(&layout.aggregated(CONGESTION_ZONES_FILE), &zone_list)?;

    let ctx = engine::session(&config.engine)?;
    engine::register_parquet_files(&ctx, "clean_trips", &clean_tables).await?;
    let start = config.zones.congestion_start;
    let rows = engine::copy_to_parquet(
        &ctx,
        &format!(
            "SELECT *,
                    {} AS zone_category,
                    pickup_time >= CAST('{start}T00:00:00' AS TIMESTAMP) AS after_congestion_start,
                    CAST(pickup_time AS DATE) AS trip_date
             FROM clean_trips
             WHERE {}",
            zone_category_sql(&ids),
            touches_zone_sql(&ids)
        ),
        &layout.zone_trips,
    )
    .await?;
    ctx.deregister_table("clean_trips")?;

    let categories = category_counts(&ctx, &layout.zone_trips).await?;
    for c in &categories {
        info!(
            zone_category = %c.zone_category,
            after_congestion_start = c.after_congestion_start,
            trips = c.trip_count,
            "Zone category"
        );
    }
    info!(rows, output = %layout.zone_trips.display(), "Zone filtering complete");

    Ok(ZoneFilterReport {
        zone_ids: ids.into_iter().collect(),
        rows,
        categories,
    })
}
