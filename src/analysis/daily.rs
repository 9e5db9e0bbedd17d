//! Daily reductions over the zone-filtered trips.
//!
//! Both functions expect `zone_trips` to be registered on the context.
//! Every output row carries `filter_predicate`, the predicate over
//! `zone_trips` that selects exactly the rows it was reduced from.

use anyhow::Result;
use datafusion::prelude::SessionContext;
use std::path::Path;

use crate::engine;

pub const DAILY_ZONE_FILE: &str = "daily_zone_aggregates.parquet";
pub const CATEGORY_FILE: &str = "trips_by_zone_category.parquet";

/// Daily Aggregate rows keyed by trip date and pickup zone.
#[tracing::instrument(skip(ctx))]
pub async fn daily_zone_aggregates(ctx: &SessionContext, output: &Path) -> Result<usize> {
    let rows = engine::copy_to_parquet(
        ctx,
        "SELECT trip_date,
                pickup_loc AS zone_id,
                COUNT(*) AS trip_count,
                SUM(COALESCE(total_amount, 0)) AS revenue,
                SUM(COALESCE(congestion_surcharge, 0)) AS surcharge_collected,
                SUM(CASE WHEN congestion_surcharge > 0 THEN 1 ELSE 0 END) AS trips_with_surcharge,
                CAST(SUM(CASE WHEN congestion_surcharge > 0 THEN 1 ELSE 0 END) AS DOUBLE)
                    / CAST(COUNT(*) AS DOUBLE) AS compliance_rate,
                concat('trip_date = DATE ''', CAST(trip_date AS VARCHAR),
                       ''' AND pickup_loc = ', CAST(pickup_loc AS VARCHAR)) AS filter_predicate
         FROM zone_trips
         GROUP BY trip_date, pickup_loc
         ORDER BY trip_date, zone_id",
        output,
    )
    .await?;
    tracing::info!(rows, "Daily zone aggregates written");
    Ok(rows)
}

/// Daily counts and money per zone category, split at the pricing start.
#[tracing::instrument(skip(ctx))]
pub async fn trips_by_zone_category(ctx: &SessionContext, output: &Path) -> Result<usize> {
    let rows = engine::copy_to_parquet(
        ctx,
        "SELECT trip_date,
                zone_category,
                after_congestion_start,
                COUNT(*) AS trip_count,
                AVG(fare) AS avg_fare,
                AVG(total_amount) AS avg_total,
                AVG(trip_distance) AS avg_distance,
                SUM(COALESCE(congestion_surcharge, 0)) AS total_congestion_collected,
                AVG(COALESCE(congestion_surcharge, 0)) AS avg_congestion_surcharge,
                SUM(CASE WHEN congestion_surcharge > 0 THEN 1 ELSE 0 END) AS trips_with_surcharge,
                SUM(CASE WHEN congestion_surcharge IS NULL OR congestion_surcharge <= 0 THEN 1 ELSE 0 END)
                    AS trips_without_surcharge,
                concat('trip_date = DATE ''', CAST(trip_date AS VARCHAR),
                       ''' AND zone_category = ''', zone_category,
                       ''' AND after_congestion_start = ', CAST(after_congestion_start AS VARCHAR))
                    AS filter_predicate
         FROM zone_trips
         GROUP BY trip_date, zone_category, after_congestion_start
         ORDER BY trip_date, zone_category, after_congestion_start",
        output,
    )
    .await?;
    tracing::info!(rows, "Zone category aggregates written");
    Ok(rows)
}
