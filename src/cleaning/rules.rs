//! The five ghost-trip rules.
//!
//! Each rule exists twice: as [`GhostRule::matches`] over a [`TripRecord`]
//! and as [`GhostRule::sql_predicate`] for the query engine. Both read the
//! same thresholds and treat a NULL operand as "does not match".

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::GhostThresholds;
use crate::model::TripRecord;

/// Signed trip duration in seconds, as a SQL expression over canonical columns.
pub const DURATION_SQL: &str =
    "(date_part('epoch', dropoff_time) - date_part('epoch', pickup_time))";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GhostRule {
    ExcessiveSpeed,
    ShortTripHighFare,
    ZeroDistancePositiveFare,
    NegativeDuration,
    NegativeFare,
}

impl GhostRule {
    /// Evaluation order. The first matching rule names the record.
    pub const ALL: [GhostRule; 5] = [
        GhostRule::ExcessiveSpeed,
        GhostRule::ShortTripHighFare,
        GhostRule::ZeroDistancePositiveFare,
        GhostRule::NegativeDuration,
        GhostRule::NegativeFare,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GhostRule::ExcessiveSpeed => "excessive_speed",
            GhostRule::ShortTripHighFare => "short_trip_high_fare",
            GhostRule::ZeroDistancePositiveFare => "zero_distance_positive_fare",
            GhostRule::NegativeDuration => "negative_duration",
            GhostRule::NegativeFare => "negative_fare",
        }
    }

    pub fn matches(&self, trip: &TripRecord, t: &GhostThresholds) -> bool {
        let d = trip.duration_seconds();
        match self {
            // cross-multiplied so zero-duration trips never divide
            GhostRule::ExcessiveSpeed => trip
                .trip_distance
                .is_some_and(|m| d >= 0.0 && m * 3600.0 > t.max_speed_mph * d),
            GhostRule::ShortTripHighFare => trip
                .fare
                .is_some_and(|f| d < t.min_trip_duration_secs && f > t.high_fare_threshold),
            GhostRule::ZeroDistancePositiveFare => {
                trip.trip_distance.is_some_and(|m| m <= t.min_distance_miles)
                    && trip.fare.is_some_and(|f| f > 0.0)
            }
            GhostRule::NegativeDuration => d < 0.0,
            GhostRule::NegativeFare => {
                trip.fare.is_some_and(|f| f < 0.0) || trip.total_amount.is_some_and(|v| v < 0.0)
            }
        }
    }

    /// The rule as a boolean SQL expression over a relation exposing the
    /// canonical columns plus `duration_seconds`.
    pub fn sql_predicate(&self, t: &GhostThresholds) -> String {
        match self {
            GhostRule::ExcessiveSpeed => format!(
                "(duration_seconds >= 0 AND trip_distance * 3600.0 > {} * duration_seconds)",
                sql_number(t.max_speed_mph)
            ),
            GhostRule::ShortTripHighFare => format!(
                "(duration_seconds < {} AND fare > {})",
                sql_number(t.min_trip_duration_secs),
                sql_number(t.high_fare_threshold)
            ),
            GhostRule::ZeroDistancePositiveFare => format!(
                "(trip_distance <= {} AND fare > 0)",
                sql_number(t.min_distance_miles)
            ),
            GhostRule::NegativeDuration => "(duration_seconds < 0)".to_string(),
            GhostRule::NegativeFare => "(fare < 0 OR total_amount < 0)".to_string(),
        }
    }

    /// The first rule `trip` violates, if any.
    pub fn first_match(trip: &TripRecord, t: &GhostThresholds) -> Option<GhostRule> {
        Self::ALL.into_iter().find(|rule| rule.matches(trip, t))
    }

    /// Every rule `trip` violates, in evaluation order.
    pub fn all_matches(trip: &TripRecord, t: &GhostThresholds) -> Vec<GhostRule> {
        Self::ALL
            .into_iter()
            .filter(|rule| rule.matches(trip, t))
            .collect()
    }
}

impl fmt::Display for GhostRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn sql_number(value: f64) -> String {
    format!("CAST({value:?} AS DOUBLE)")
}

/// `CASE` expression yielding the first matching rule name, or NULL.
pub fn ghost_flag_sql(t: &GhostThresholds) -> String {
    let arms: Vec<String> = GhostRule::ALL
        .iter()
        .map(|rule| format!("WHEN {} THEN '{}'", rule.sql_predicate(t), rule.as_str()))
        .collect();
    format!("CASE {} ELSE NULL END", arms.join(" "))
}

/// Comma-separated names of every matching rule; empty for clean records.
pub fn matched_rules_sql(t: &GhostThresholds) -> String {
    let parts: Vec<String> = GhostRule::ALL
        .iter()
        .map(|rule| format!("CASE WHEN {} THEN '{}' END", rule.sql_predicate(t), rule.as_str()))
        .collect();
    format!("concat_ws(',', {})", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaxiType;
    use chrono::{Duration, NaiveDateTime};

    fn trip(duration_secs: i64, distance: Option<f64>, fare: Option<f64>, total: Option<f64>) -> TripRecord {
        let pickup =
            NaiveDateTime::parse_from_str("2025-01-06 08:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        TripRecord {
            pickup_time: pickup,
            dropoff_time: pickup + Duration::seconds(duration_secs),
            pickup_loc: 161,
            dropoff_loc: 236,
            trip_distance: distance,
            fare,
            total_amount: total,
            congestion_surcharge: Some(2.5),
            taxi_type: TaxiType::Yellow,
        }
    }

    #[test]
    fn test_each_rule_in_isolation() {
        let t = GhostThresholds::default();
        let cases = [
            // 10 miles in 5 minutes is 120 mph
            (trip(300, Some(10.0), Some(15.0), Some(20.0)), GhostRule::ExcessiveSpeed),
            (trip(30, Some(0.2), Some(25.0), Some(30.0)), GhostRule::ShortTripHighFare),
            (trip(600, Some(0.0), Some(8.0), Some(10.0)), GhostRule::ZeroDistancePositiveFare),
            (trip(-120, None, Some(10.0), Some(12.0)), GhostRule::NegativeDuration),
            (trip(600, Some(2.0), Some(-5.0), Some(-2.0)), GhostRule::NegativeFare),
        ];
        for (record, expected) in cases {
            assert_eq!(GhostRule::first_match(&record, &t), Some(expected), "{expected}");
        }
    }

    #[test]
    fn test_ordinary_trip_is_clean() {
        let t = GhostThresholds::default();
        assert_eq!(GhostRule::first_match(&trip(900, Some(3.0), Some(18.0), Some(24.0)), &t), None);
    }

    #[test]
    fn test_zero_duration_is_not_negative() {
        let t = GhostThresholds::default();
        let record = trip(0, Some(0.0), Some(0.0), Some(0.0));
        assert!(!GhostRule::NegativeDuration.matches(&record, &t));
        // zero distance over zero time is not a speed violation either
        assert!(!GhostRule::ExcessiveSpeed.matches(&record, &t));
    }

    #[test]
    fn test_first_match_follows_rule_order() {
        let t = GhostThresholds::default();
        // 5 miles in 10 seconds with a $50 fare trips both speed and short-trip rules
        let record = trip(10, Some(5.0), Some(50.0), Some(55.0));
        assert_eq!(
            GhostRule::all_matches(&record, &t),
            vec![GhostRule::ExcessiveSpeed, GhostRule::ShortTripHighFare]
        );
        assert_eq!(GhostRule::first_match(&record, &t), Some(GhostRule::ExcessiveSpeed));
    }

    #[test]
    fn test_null_operands_do_not_match() {
        let t = GhostThresholds::default();
        let record = trip(10, None, None, None);
        assert_eq!(GhostRule::all_matches(&record, &t), vec![]);
        // negative total alone is enough when fare is NULL
        let record = trip(600, Some(1.0), None, Some(-3.0));
        assert_eq!(GhostRule::first_match(&record, &t), Some(GhostRule::NegativeFare));
    }

    #[test]
    fn test_sql_uses_thresholds() {
        let t = GhostThresholds {
            max_speed_mph: 50.0,
            ..Default::default()
        };
        assert!(GhostRule::ExcessiveSpeed.sql_predicate(&t).contains("CAST(50.0 AS DOUBLE)"));
        let case = ghost_flag_sql(&t);
        assert!(case.starts_with("CASE WHEN (duration_seconds >= 0"));
        assert!(case.ends_with("THEN 'negative_fare' ELSE NULL END"));
    }
}
