use anyhow::Result;
use datafusion::prelude::SessionContext;
use tracing::info;

use crate::analysis::types::{LeakageSummary, LeakageZone};
use crate::analysis::utility::pct_of;
use crate::config::AnalysisConfig;
use crate::engine::columns;
use crate::zones::{ZoneCategory, ZoneLookup};

pub const LEAKAGE_FILE: &str = "leakage_summary.json";

/// Trips that crossed the zone boundary after pricing started.
pub fn cross_border_predicate() -> String {
    format!(
        "after_congestion_start AND zone_category IN ('{}', '{}')",
        ZoneCategory::EnteringZone,
        ZoneCategory::ExitingZone
    )
}

fn entering_predicate() -> String {
    format!(
        "after_congestion_start AND zone_category = '{}'",
        ZoneCategory::EnteringZone
    )
}

/// Leakage and compliance of cross-border trips, with the pickup zones
/// whose entering trips most often lack the surcharge.
///
/// Expects `zone_trips` to be registered on the context.
#[tracing::instrument(skip_all)]
pub async fn analyze_leakage(
    ctx: &SessionContext,
    config: &AnalysisConfig,
    lookup: &ZoneLookup,
) -> Result<LeakageSummary> {
    let predicate = cross_border_predicate();
    let totals = ctx
        .sql(&format!(
            "SELECT COUNT(*) AS total_trips,
                    COALESCE(SUM(CASE WHEN congestion_surcharge > 0 THEN 1 ELSE 0 END), 0)
                        AS trips_with_surcharge,
                    COALESCE(SUM(COALESCE(congestion_surcharge, 0)), 0) AS revenue_collected
             FROM zone_trips
             WHERE {predicate}"
        ))
        .await?
        .collect()
        .await?;

    let total_trips = columns::scalar_i64(&totals, "total_trips")?;
    let with_surcharge = columns::scalar_i64(&totals, "trips_with_surcharge")?;
    let without_surcharge = total_trips - with_surcharge;
    let revenue_collected = columns::gather(&totals, "revenue_collected", columns::f64s)?
        .into_iter()
        .next()
        .flatten()
        .unwrap_or(0.0);

    let entering = entering_predicate();
    let zones = ctx
        .sql(&format!(
            "SELECT pickup_loc,
                    COUNT(*) AS trips,
                    SUM(CASE WHEN congestion_surcharge > 0 THEN 0 ELSE 1 END) AS trips_without_surcharge
             FROM zone_trips
             WHERE {entering}
             GROUP BY pickup_loc
             ORDER BY trips_without_surcharge DESC, pickup_loc
             LIMIT {}",
            config.top_leakage_zones
        ))
        .await?
        .collect()
        .await?;

    let pickup = columns::gather(&zones, "pickup_loc", columns::i64s)?;
    let trips = columns::gather(&zones, "trips", columns::i64s)?;
    let missing = columns::gather(&zones, "trips_without_surcharge", columns::i64s)?;
    let top_leakage_zones = pickup
        .into_iter()
        .zip(trips)
        .zip(missing)
        .filter_map(|((pickup, trips), missing)| {
            let pickup_loc = pickup? as i32;
            let (trips, missing) = (trips.unwrap_or(0), missing.unwrap_or(0));
            let zone = lookup.get(pickup_loc);
            Some(LeakageZone {
                pickup_loc,
                zone_name: zone.map(|z| z.zone.clone()),
                borough: zone.map(|z| z.borough.clone()),
                trips,
                trips_without_surcharge: missing,
                leakage_pct: pct_of(missing as f64, trips as f64),
                filter_predicate: format!("{entering} AND pickup_loc = {pickup_loc}"),
            })
        })
        .collect();

    let summary = LeakageSummary {
        filter_predicate: predicate,
        total_trips,
        trips_with_surcharge: with_surcharge,
        trips_without_surcharge: without_surcharge,
        leakage_pct: pct_of(without_surcharge as f64, total_trips as f64),
        total_revenue_collected: revenue_collected,
        toll_amount: config.toll_amount,
        estimated_revenue_lost: without_surcharge as f64 * config.toll_amount,
        top_leakage_zones,
    };

    info!(
        total_trips = summary.total_trips,
        without_surcharge = summary.trips_without_surcharge,
        leakage_pct = %format!("{:.2}", summary.leakage_pct),
        revenue_lost = %format!("{:.2}", summary.estimated_revenue_lost),
        "Leakage analysis complete"
    );
    Ok(summary)
}
