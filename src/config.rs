//! Pipeline configuration.
//!
//! Every knob lives on [`PipelineConfig`], which is loaded from an optional
//! JSON file and handed to each stage by reference. Any field missing from the
//! file falls back to its default:
//!
//! ```json
//! {
//!   "data_dir": "data",
//!   "periods": ["2024-01", "2024-02", "2025-01"],
//!   "thresholds": { "max_speed_mph": 65.0 },
//!   "zones": { "zone_ids": [4, 12, 13, 45] }
//! }
//! ```

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PipelineError;
use crate::model::{Period, TaxiType};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root of the data tree; see [`Layout`].
    pub data_dir: PathBuf,
    /// Months every taxi type is expected to have a raw file for.
    pub periods: Vec<Period>,
    /// Rebuild per-file outputs that already exist.
    pub overwrite: bool,
    pub retry: RetryPolicy,
    pub thresholds: GhostThresholds,
    pub imputation: Vec<ImputationTarget>,
    pub zones: ZoneConfig,
    pub analysis: AnalysisConfig,
    pub weather: WeatherConfig,
    pub engine: EngineConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let periods = (2023..=2025)
            .flat_map(|year| (1..=12).map(move |month| Period { year, month }))
            .collect();

        Self {
            data_dir: PathBuf::from("data"),
            periods,
            overwrite: false,
            retry: RetryPolicy::default(),
            thresholds: GhostThresholds::default(),
            imputation: vec![ImputationTarget::default()],
            zones: ZoneConfig::default(),
            analysis: AnalysisConfig::default(),
            weather: WeatherConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads the config from a JSON file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.data_dir, &self.zones, &self.weather)
    }

    /// Whether `period` is a declared gap the imputer may fill.
    pub fn is_imputation_target(&self, period: Period) -> bool {
        self.imputation.iter().any(|t| t.period == period)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(PipelineError::InvalidConfig(msg).into()) };

        if self.periods.is_empty() {
            return invalid("at least one period must be configured".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }
        let t = &self.thresholds;
        let finite = [
            ("thresholds.max_speed_mph", t.max_speed_mph),
            ("thresholds.min_trip_duration_secs", t.min_trip_duration_secs),
            ("thresholds.high_fare_threshold", t.high_fare_threshold),
            ("thresholds.min_distance_miles", t.min_distance_miles),
            ("weather.rainy_day_threshold_mm", self.weather.rainy_day_threshold_mm),
        ];
        if let Some((name, value)) = finite.iter().find(|(_, v)| !v.is_finite()) {
            return invalid(format!("{name} must be a finite number, got {value}"));
        }
        if t.max_speed_mph <= 0.0 || t.min_trip_duration_secs < 0.0 || t.min_distance_miles < 0.0 {
            return invalid("ghost thresholds must be non-negative and max speed positive".into());
        }
        for target in &self.imputation {
            if target.sources.is_empty() {
                return invalid(format!("imputation target {} has no sources", target.period));
            }
            if let Some(source) = target
                .sources
                .iter()
                .find(|s| !(s.weight > 0.0 && s.weight.is_finite()))
            {
                return invalid(format!(
                    "imputation weight for {} must be positive, got {}",
                    source.period, source.weight
                ));
            }
            if target.sources.iter().any(|s| s.period == target.period) {
                return invalid(format!("imputation target {} uses itself as a source", target.period));
            }
        }
        if let Some(ids) = &self.zones.zone_ids {
            if ids.is_empty() {
                return invalid("zones.zone_ids must not be empty when set".into());
            }
        }
        if self.analysis.quarter_months.is_empty()
            || self.analysis.quarter_months.iter().any(|m| !(1..=12).contains(m))
        {
            return invalid("analysis.quarter_months must hold months 1-12".into());
        }
        Ok(())
    }
}

/// Where every stage reads and writes, derived from `data_dir`.
#[derive(Debug, Clone)]
pub struct Layout {
    pub raw_dir: PathBuf,
    pub zone_lookup: PathBuf,
    pub weather_file: PathBuf,
    pub unified_dir: PathBuf,
    pub malformed_dir: PathBuf,
    pub clean_dir: PathBuf,
    pub ghost_dir: PathBuf,
    pub imputed_dir: PathBuf,
    pub zone_trips: PathBuf,
    pub aggregated_dir: PathBuf,
    pub audit_dir: PathBuf,
}

impl Layout {
    fn new(data_dir: &Path, zones: &ZoneConfig, weather: &WeatherConfig) -> Self {
        let raw_dir = data_dir.join("raw");
        let processed = data_dir.join("processed");
        Self {
            zone_lookup: zones
                .lookup_path
                .clone()
                .unwrap_or_else(|| raw_dir.join("taxi_zones").join("taxi_zone_lookup.csv")),
            weather_file: weather
                .path
                .clone()
                .unwrap_or_else(|| raw_dir.join("weather").join("daily.csv")),
            raw_dir,
            unified_dir: processed.join("unified"),
            malformed_dir: processed.join("malformed"),
            clean_dir: processed.join("clean"),
            ghost_dir: processed.join("ghost_trips"),
            imputed_dir: processed.join("imputed"),
            zone_trips: processed.join("zone_filtered").join("zone_trips.parquet"),
            aggregated_dir: data_dir.join("aggregated"),
            audit_dir: data_dir.join("audit"),
        }
    }

    pub fn raw_taxi_dir(&self, taxi_type: TaxiType) -> PathBuf {
        self.raw_dir.join(taxi_type.as_str())
    }

    pub fn aggregated(&self, file_name: &str) -> PathBuf {
        self.aggregated_dir.join(file_name)
    }

    /// Creates every output directory.
    pub fn create_directories(&self) -> Result<()> {
        let dirs = [
            &self.unified_dir,
            &self.malformed_dir,
            &self.clean_dir,
            &self.ghost_dir,
            &self.imputed_dir,
            &self.aggregated_dir,
            &self.audit_dir,
        ];
        for dir in dirs {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        if let Some(parent) = self.zone_trips.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Exponential backoff for files that have not landed yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Thresholds for the ghost-trip rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GhostThresholds {
    pub max_speed_mph: f64,
    pub min_trip_duration_secs: f64,
    pub high_fare_threshold: f64,
    pub min_distance_miles: f64,
}

impl Default for GhostThresholds {
    fn default() -> Self {
        Self {
            max_speed_mph: 65.0,
            min_trip_duration_secs: 60.0,
            high_fare_threshold: 20.0,
            min_distance_miles: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedSource {
    pub period: Period,
    pub weight: f64,
}

/// A calendar gap and the reference periods that fill it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImputationTarget {
    pub period: Period,
    pub sources: Vec<WeightedSource>,
}

impl Default for ImputationTarget {
    fn default() -> Self {
        Self {
            period: Period { year: 2025, month: 12 },
            sources: vec![
                WeightedSource {
                    period: Period { year: 2023, month: 12 },
                    weight: 0.3,
                },
                WeightedSource {
                    period: Period { year: 2024, month: 12 },
                    weight: 0.7,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    /// Zone lookup CSV; defaults to `raw/taxi_zones/taxi_zone_lookup.csv`.
    pub lookup_path: Option<PathBuf>,
    /// Explicit congestion zone ids. When unset, zones are picked from the
    /// lookup by borough and name keyword.
    pub zone_ids: Option<Vec<i32>>,
    pub borough: String,
    pub keywords: Vec<String>,
    pub congestion_start: NaiveDate,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        let keywords = [
            "Financial",
            "Battery",
            "Tribeca",
            "SoHo",
            "Chinatown",
            "Lower East Side",
            "East Village",
            "West Village",
            "Greenwich",
            "Chelsea",
            "Gramercy",
            "Murray Hill",
            "Midtown",
            "Clinton",
            "Garment",
            "Times Sq",
            "Penn Station",
            "Flatiron",
        ];
        Self {
            lookup_path: None,
            zone_ids: None,
            borough: "Manhattan".to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            congestion_start: NaiveDate::from_ymd_opt(2025, 1, 5).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Toll charged per trip, used to estimate lost revenue.
    pub toll_amount: f64,
    pub top_leakage_zones: usize,
    pub baseline_year: i32,
    pub comparison_year: i32,
    pub quarter_months: Vec<u32>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            toll_amount: 9.0,
            top_leakage_zones: 3,
            baseline_year: 2024,
            comparison_year: 2025,
            quarter_months: vec![1, 2, 3],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    /// Daily weather CSV (optionally `.csv.gz`); defaults to `raw/weather/daily.csv`.
    pub path: Option<PathBuf>,
    pub rainy_day_threshold_mm: f64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            path: None,
            rainy_day_threshold_mm: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub memory_limit_bytes: Option<usize>,
    pub target_partitions: Option<usize>,
    pub batch_size: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: Some(4 * 1024 * 1024 * 1024),
            target_partitions: None,
            batch_size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.periods.len(), 36);
        assert!(config.is_imputation_target(Period { year: 2025, month: 12 }));
        assert!(!config.is_imputation_target(Period { year: 2025, month: 11 }));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{ "periods": ["2025-01"], "thresholds": { "max_speed_mph": 50.0 } }"#,
        )
        .unwrap();
        assert_eq!(config.periods, vec![Period { year: 2025, month: 1 }]);
        assert_eq!(config.thresholds.max_speed_mph, 50.0);
        assert_eq!(config.thresholds.high_fare_threshold, 20.0);
        assert_eq!(config.analysis.toll_amount, 9.0);
        assert_eq!(
            config.zones.congestion_start,
            NaiveDate::from_ymd_opt(2025, 1, 5).unwrap()
        );
    }

    #[test]
    fn test_validate_rejects_bad_weights() {
        let mut config = PipelineConfig::default();
        config.imputation[0].sources[0].weight = 0.0;
        let err = config.validate().unwrap_err();
        assert!(err.downcast_ref::<PipelineError>().is_some());

        let mut config = PipelineConfig::default();
        config.imputation[0].sources.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_numbers() {
        let cases: [fn(&mut PipelineConfig); 6] = [
            |c| c.thresholds.max_speed_mph = f64::NAN,
            |c| c.thresholds.max_speed_mph = f64::INFINITY,
            |c| c.thresholds.min_trip_duration_secs = f64::NAN,
            |c| c.thresholds.high_fare_threshold = f64::NEG_INFINITY,
            |c| c.thresholds.min_distance_miles = f64::NAN,
            |c| c.weather.rainy_day_threshold_mm = f64::INFINITY,
        ];
        for set in cases {
            let mut config = PipelineConfig::default();
            set(&mut config);
            let err = config.validate().unwrap_err();
            assert!(matches!(
                err.downcast_ref::<PipelineError>(),
                Some(PipelineError::InvalidConfig(msg)) if msg.contains("finite")
            ));
        }

        let mut config = PipelineConfig::default();
        config.imputation[0].sources[0].weight = f64::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_zone_ids() {
        let mut config = PipelineConfig::default();
        config.zones.zone_ids = Some(vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 300,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(300));
        assert_eq!(policy.delay_after(4), Duration::from_millis(300));
    }

    #[test]
    fn test_layout_paths() {
        let config = PipelineConfig {
            data_dir: PathBuf::from("/tmp/audit"),
            ..Default::default()
        };
        let layout = config.layout();
        assert_eq!(layout.raw_taxi_dir(TaxiType::Green), PathBuf::from("/tmp/audit/raw/green"));
        assert_eq!(
            layout.zone_lookup,
            PathBuf::from("/tmp/audit/raw/taxi_zones/taxi_zone_lookup.csv")
        );
        assert_eq!(layout.clean_dir, PathBuf::from("/tmp/audit/processed/clean"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{ "overwrite": true, "zones": { "zone_ids": [13, 87] } }"#).unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert!(config.overwrite);
        assert_eq!(config.zones.zone_ids, Some(vec![13, 87]));
        assert_eq!(config.zones.borough, "Manhattan");
    }
}
