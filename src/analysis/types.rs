//! Data types produced by the aggregation stage.

use serde::Serialize;

use crate::model::TaxiType;

/// A pickup zone ranked by trips that entered the zone without paying.
#[derive(Debug, Clone, Serialize)]
pub struct LeakageZone {
    pub pickup_loc: i32,
    pub zone_name: Option<String>,
    pub borough: Option<String>,
    pub trips: i64,
    pub trips_without_surcharge: i64,
    pub leakage_pct: f64,
    pub filter_predicate: String,
}

/// Compliance of cross-border trips after pricing started, written as
/// `leakage_summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct LeakageSummary {
    pub filter_predicate: String,
    pub total_trips: i64,
    pub trips_with_surcharge: i64,
    pub trips_without_surcharge: i64,
    pub leakage_pct: f64,
    pub total_revenue_collected: f64,
    pub toll_amount: f64,
    pub estimated_revenue_lost: f64,
    pub top_leakage_zones: Vec<LeakageZone>,
}

/// Volume and money for one taxi type over one year's quarter months.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeriodStats {
    pub year: i32,
    pub trips: i64,
    pub avg_fare: Option<f64>,
    pub avg_total: Option<f64>,
    pub revenue: f64,
    pub filter_predicate: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaxiComparison {
    pub taxi_type: TaxiType,
    pub baseline: PeriodStats,
    pub comparison: PeriodStats,
    pub trip_change_pct: Option<f64>,
    pub fare_change_pct: Option<f64>,
    pub revenue_change_pct: Option<f64>,
    /// Share of all trips in each year, in percent.
    pub baseline_share_pct: f64,
    pub comparison_share_pct: f64,
}

/// Yellow vs green over the same months of two years, written as
/// `yellow_vs_green_comparison.json`.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonSummary {
    pub baseline_year: i32,
    pub comparison_year: i32,
    pub months: Vec<u32>,
    pub taxi_types: Vec<TaxiComparison>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateReport {
    pub daily_zone_rows: usize,
    pub category_rows: usize,
    pub leakage: LeakageSummary,
    pub comparison: ComparisonSummary,
}
