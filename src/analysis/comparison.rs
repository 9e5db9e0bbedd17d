use anyhow::Result;
use datafusion::prelude::SessionContext;
use std::collections::HashMap;
use tracing::info;

use crate::analysis::types::{ComparisonSummary, PeriodStats, TaxiComparison};
use crate::analysis::utility::{pct_change, pct_of};
use crate::config::AnalysisConfig;
use crate::engine::columns;
use crate::model::TaxiType;

pub const COMPARISON_FILE: &str = "yellow_vs_green_comparison.json";

fn month_list(months: &[u32]) -> String {
    months.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(", ")
}

fn period_predicate(taxi_type: TaxiType, year: i32, months: &[u32]) -> String {
    format!(
        "taxi_type = '{taxi_type}' AND date_part('year', pickup_time) = {year} \
         AND date_part('month', pickup_time) IN ({})",
        month_list(months)
    )
}

/// Yellow vs green volume and money for the quarter months of the baseline
/// and comparison years.
///
/// Expects `clean_trips` to be registered on the context.
#[tracing::instrument(skip_all)]
pub async fn compare_taxi_types(
    ctx: &SessionContext,
    config: &AnalysisConfig,
) -> Result<ComparisonSummary> {
    let (baseline, comparison) = (config.baseline_year, config.comparison_year);
    let months = month_list(&config.quarter_months);

    let batches = ctx
        .sql(&format!(
            "SELECT taxi_type, trip_year,
                    COUNT(*) AS trips,
                    AVG(fare) AS avg_fare,
                    AVG(total_amount) AS avg_total,
                    COALESCE(SUM(total_amount), 0) AS revenue
             FROM (SELECT *, CAST(date_part('year', pickup_time) AS BIGINT) AS trip_year
                   FROM clean_trips
                   WHERE date_part('month', pickup_time) IN ({months})) quarter
             WHERE trip_year IN ({baseline}, {comparison})
             GROUP BY taxi_type, trip_year"
        ))
        .await?
        .collect()
        .await?;

    let mut stats: HashMap<(String, i64), PeriodStats> = HashMap::new();
    for batch in &batches {
        let taxi = columns::strings(batch, "taxi_type")?;
        let year = columns::i64s(batch, "trip_year")?;
        let trips = columns::i64s(batch, "trips")?;
        let fare = columns::f64s(batch, "avg_fare")?;
        let total = columns::f64s(batch, "avg_total")?;
        let revenue = columns::f64s(batch, "revenue")?;
        for i in 0..batch.num_rows() {
            let (Some(taxi), Some(year)) = (taxi[i].clone(), year[i]) else {
                continue;
            };
            stats.insert(
                (taxi, year),
                PeriodStats {
                    year: year as i32,
                    trips: trips[i].unwrap_or(0),
                    avg_fare: fare[i],
                    avg_total: total[i],
                    revenue: revenue[i].unwrap_or(0.0),
                    filter_predicate: String::new(),
                },
            );
        }
    }

    let mut lookup = |taxi_type: TaxiType, year: i32| {
        let mut s = stats
            .remove(&(taxi_type.to_string(), year as i64))
            .unwrap_or_else(|| PeriodStats {
                year,
                ..Default::default()
            });
        s.filter_predicate = period_predicate(taxi_type, year, &config.quarter_months);
        s
    };

    let per_taxi: Vec<(TaxiType, PeriodStats, PeriodStats)> = TaxiType::ALL
        .into_iter()
        .map(|t| (t, lookup(t, baseline), lookup(t, comparison)))
        .collect();
    let baseline_total: i64 = per_taxi.iter().map(|(_, b, _)| b.trips).sum();
    let comparison_total: i64 = per_taxi.iter().map(|(_, _, c)| c.trips).sum();

    let taxi_types = per_taxi
        .into_iter()
        .map(|(taxi_type, before, after)| {
            let fare_change_pct = match (before.avg_fare, after.avg_fare) {
                (Some(b), Some(a)) => pct_change(b, a),
                _ => None,
            };
            TaxiComparison {
                taxi_type,
                trip_change_pct: pct_change(before.trips as f64, after.trips as f64),
                fare_change_pct,
                revenue_change_pct: pct_change(before.revenue, after.revenue),
                baseline_share_pct: pct_of(before.trips as f64, baseline_total as f64),
                comparison_share_pct: pct_of(after.trips as f64, comparison_total as f64),
                baseline: before,
                comparison: after,
            }
        })
        .collect::<Vec<_>>();

    for c in &taxi_types {
        info!(
            taxi_type = %c.taxi_type,
            baseline_trips = c.baseline.trips,
            comparison_trips = c.comparison.trips,
            trip_change_pct = ?c.trip_change_pct,
            revenue_change_pct = ?c.revenue_change_pct,
            "Taxi type comparison"
        );
    }

    Ok(ComparisonSummary {
        baseline_year: baseline,
        comparison_year: comparison,
        months: config.quarter_months.clone(),
        taxi_types,
    })
}
