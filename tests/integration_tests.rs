use congestion_audit::cleaning::GhostRule;
use congestion_audit::cleaning::detect::{CLEAN_TAG, GHOST_SUMMARY_FILE, GHOST_TAG};
use congestion_audit::config::{ImputationTarget, PipelineConfig, RetryPolicy, WeightedSource};
use congestion_audit::engine::{self, columns};
use congestion_audit::error::PipelineError;
use congestion_audit::imputation::imputed_file_name;
use congestion_audit::model::{Period, TaxiType, TripRecord, stage_file_name};
use congestion_audit::pipeline::{self, PIPELINE_RUNS_FILE, Stage};
use congestion_audit::schema;
use congestion_audit::weather::WEATHER_SUMMARY_FILE;
use std::collections::BTreeSet;
use std::path::Path;

const YELLOW_HEADER: &str = "tpep_pickup_datetime,tpep_dropoff_datetime,PULocationID,DOLocationID,\
                             trip_distance,fare_amount,total_amount,congestion_surcharge";
const GREEN_HEADER: &str = "lpep_pickup_datetime,lpep_dropoff_datetime,PULocationID,DOLocationID,\
                            trip_distance,fare_amount,total_amount,congestion_surcharge";

const LOOKUP: &str = "LocationID,Borough,Zone,service_zone\n\
    7,Queens,Astoria,Boro Zone\n\
    13,Manhattan,Battery Park City,Yellow Zone\n\
    74,Manhattan,East Harlem North,Boro Zone\n\
    161,Manhattan,Midtown Center,Yellow Zone\n";

const WEATHER: &str = "date,tavg,tmin,tmax,prcp,snow,wdir,wspd,wpgt,pres,tsun\n\
    2025-01-06,1.5,-2.0,4.0,0.0,,,,,,\n\
    2025-01-07,3.0,0.0,6.0,5.2,,,,,,\n";

/// January 2025 yellow trips: four clean, one ghost per rule.
const YELLOW_2025_01: &[&str] = &[
    "2025-01-06 08:00:00,2025-01-06 08:20:00,7,161,3.0,20.0,25.0,0.0",
    "2025-01-06 09:00:00,2025-01-06 09:15:00,7,161,2.5,18.0,25.5,2.5",
    "2025-01-06 10:00:00,2025-01-06 10:00:30,161,7,0.5,25.0,30.0,2.5",
    "2025-01-07 11:00:00,2025-01-07 11:05:00,161,13,100.0,30.0,35.0,2.5",
    "2025-01-07 12:00:00,2025-01-07 12:30:00,13,161,0.0,50.0,55.0,2.5",
    "2025-01-07 13:00:00,2025-01-07 13:20:00,7,74,4.0,15.0,20.0,0.0",
    "2025-01-07 14:00:00,2025-01-07 13:50:00,74,161,1.0,10.0,12.0,0.0",
    "2025-01-07 16:00:00,2025-01-07 16:25:00,13,7,3.5,19.0,24.0,2.5",
    "2025-01-08 15:00:00,2025-01-08 15:20:00,161,161,2.0,-5.0,-2.0,2.5",
];

const YELLOW_2024_01: &[&str] = &[
    "2024-01-08 08:00:00,2024-01-08 08:20:00,7,161,3.0,20.0,23.0,2.5",
    "2024-01-09 09:00:00,2024-01-09 09:30:00,161,13,2.0,15.0,18.0,2.5",
];

const YELLOW_2024_12: &[&str] = &[
    "2024-12-02 08:00:00,2024-12-02 08:20:00,7,161,3.0,20.0,25.0,2.5",
    "2024-12-02 09:00:00,2024-12-02 09:20:00,13,161,2.0,16.0,21.0,2.5",
    "2024-12-03 10:00:00,2024-12-03 10:15:00,161,13,1.5,12.0,17.0,2.5",
];

const GREEN_2025_01: &[&str] = &[
    "2025-01-06 08:30:00,2025-01-06 08:50:00,74,161,2.0,14.0,18.0,0.0",
    "2025-01-09 10:00:00,2025-01-09 10:20:00,74,7,3.0,12.0,15.0,0.0",
];

const GREEN_2024_01: &[&str] = &["2024-01-10 08:30:00,2024-01-10 08:50:00,74,161,2.0,14.0,16.0,0.0"];

const GREEN_2024_12: &[&str] = &["2024-12-05 08:30:00,2024-12-05 08:50:00,74,7,2.0,11.0,13.0,0.0"];

fn period(year: i32, month: u32) -> Period {
    Period { year, month }
}

fn write_raw(config: &PipelineConfig, taxi: TaxiType, period: Period, rows: &[&str]) {
    let dir = config.layout().raw_taxi_dir(taxi);
    std::fs::create_dir_all(&dir).unwrap();
    let header = match taxi {
        TaxiType::Yellow => YELLOW_HEADER,
        TaxiType::Green => GREEN_HEADER,
    };
    let body = format!("{header}\n{}\n", rows.join("\n"));
    std::fs::write(dir.join(format!("{taxi}_tripdata_{period}.csv")), body).unwrap();
}

/// Builds a data tree where December 2025 is missing for both taxi types
/// and is filled from December 2024.
fn prepare(dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig {
        data_dir: dir.to_path_buf(),
        periods: vec![period(2024, 1), period(2024, 12), period(2025, 1), period(2025, 12)],
        retry: RetryPolicy {
            max_attempts: 1,
            initial_delay_ms: 1,
            multiplier: 1.0,
            max_delay_ms: 1,
        },
        imputation: vec![ImputationTarget {
            period: period(2025, 12),
            sources: vec![WeightedSource {
                period: period(2024, 12),
                weight: 1.0,
            }],
        }],
        ..Default::default()
    };
    config.zones.zone_ids = Some(vec![13, 161]);

    let layout = config.layout();
    std::fs::create_dir_all(layout.zone_lookup.parent().unwrap()).unwrap();
    std::fs::write(&layout.zone_lookup, LOOKUP).unwrap();
    std::fs::create_dir_all(layout.weather_file.parent().unwrap()).unwrap();
    std::fs::write(&layout.weather_file, WEATHER).unwrap();

    write_raw(&config, TaxiType::Yellow, period(2025, 1), YELLOW_2025_01);
    write_raw(&config, TaxiType::Yellow, period(2024, 1), YELLOW_2024_01);
    write_raw(&config, TaxiType::Yellow, period(2024, 12), YELLOW_2024_12);
    write_raw(&config, TaxiType::Green, period(2025, 1), GREEN_2025_01);
    write_raw(&config, TaxiType::Green, period(2024, 1), GREEN_2024_01);
    write_raw(&config, TaxiType::Green, period(2024, 12), GREEN_2024_12);
    config
}

#[tokio::test]
async fn test_full_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let config = prepare(dir.path());

    let runs = pipeline::run_all(&config, false).await.unwrap();
    let stages: Vec<&str> = runs.iter().map(|r| r.stage.as_str()).collect();
    assert_eq!(
        stages,
        vec!["ingest", "unify", "clean", "impute", "zones", "aggregate", "weather"]
    );
    assert!(runs.iter().all(|r| r.status == "ok"));

    let layout = config.layout();
    let log = std::fs::read_to_string(layout.audit_dir.join(PIPELINE_RUNS_FILE)).unwrap();
    assert_eq!(log.lines().count(), 8);
    assert!(layout.audit_dir.join(GHOST_SUMMARY_FILE).exists());

    for taxi in TaxiType::ALL {
        let imputed = layout.imputed_dir.join(imputed_file_name(taxi, period(2025, 12)));
        assert!(imputed.exists(), "missing {}", imputed.display());
        assert!(imputed.with_extension("json").exists());
    }

    let summary: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(layout.aggregated(WEATHER_SUMMARY_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(summary["days_with_weather"], 2);
}

#[tokio::test]
async fn test_ghost_flags_match_rules() {
    let dir = tempfile::tempdir().unwrap();
    let config = prepare(dir.path());
    pipeline::run_all(&config, false).await.unwrap();

    let layout = config.layout();
    let ctx = engine::session(&config.engine).unwrap();
    let jan = period(2025, 1);

    let clean_path = layout.clean_dir.join(stage_file_name(TaxiType::Yellow, CLEAN_TAG, jan));
    let clean = engine::read_parquet_files(&ctx, &[clean_path])
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    let clean_trips = TripRecord::from_batches(&clean).unwrap();
    assert_eq!(clean_trips.len(), 4);
    for trip in &clean_trips {
        assert_eq!(GhostRule::first_match(trip, &config.thresholds), None);
    }

    let ghost_path = layout.ghost_dir.join(stage_file_name(TaxiType::Yellow, GHOST_TAG, jan));
    let ghosts = engine::read_parquet_files(&ctx, &[ghost_path])
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    let ghost_trips = TripRecord::from_batches(&ghosts).unwrap();
    let flags = columns::gather(&ghosts, "ghost_flag", columns::strings).unwrap();
    assert_eq!(ghost_trips.len(), 5);

    let mut seen = BTreeSet::new();
    for (trip, flag) in ghost_trips.iter().zip(flags) {
        let expected = GhostRule::first_match(trip, &config.thresholds).unwrap();
        assert_eq!(flag.as_deref(), Some(expected.as_str()));
        seen.insert(expected.as_str());
    }
    assert_eq!(seen.len(), GhostRule::ALL.len());
}

#[tokio::test]
async fn test_daily_counts_match_zone_trips() {
    let dir = tempfile::tempdir().unwrap();
    let config = prepare(dir.path());
    pipeline::run_all(&config, true).await.unwrap();

    let layout = config.layout();
    let ctx = engine::session(&config.engine).unwrap();
    let zone_rows = engine::row_count(&ctx, &layout.zone_trips).await.unwrap();

    let daily = engine::read_parquet_files(
        &ctx,
        &[layout.aggregated("daily_zone_aggregates.parquet")],
    )
    .await
    .unwrap()
    .collect()
    .await
    .unwrap();
    let total: i64 = columns::gather(&daily, "trip_count", columns::i64s)
        .unwrap()
        .into_iter()
        .flatten()
        .sum();
    assert_eq!(total as usize, zone_rows);

    let rates = columns::gather(&daily, "compliance_rate", columns::f64s).unwrap();
    assert!(rates.into_iter().flatten().all(|r| (0.0..=1.0).contains(&r)));
}

#[tokio::test]
async fn test_rerun_skips_existing_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let config = prepare(dir.path());
    pipeline::run_all(&config, false).await.unwrap();

    let outcomes = schema::unify_all(&config).await.unwrap();
    assert_eq!(outcomes.len(), 6);
    assert!(outcomes.iter().all(|o| o.skipped));

    let rerun = pipeline::run_all(&config, true).await.unwrap();
    assert_eq!(rerun.len(), 6);
}

#[tokio::test]
async fn test_missing_source_outside_imputation_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = prepare(dir.path());
    config.periods.push(period(2024, 6));

    let err = pipeline::run_all(&config, false).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::SourceUnavailable { attempts: 1, .. })
    ));

    let layout = config.layout();
    let log = std::fs::read_to_string(layout.audit_dir.join(PIPELINE_RUNS_FILE)).unwrap();
    let last = log.lines().last().unwrap();
    assert!(last.contains(",ingest,"));
    assert!(last.contains(",failed,"));
    assert!(engine::list_parquet(&layout.unified_dir).unwrap().is_empty());
}

#[tokio::test]
async fn test_stage_without_upstream_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let config = prepare(dir.path());

    let err = pipeline::run_single(&config, Stage::Aggregate).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::MissingUpstream { stage: "aggregate", .. })
    ));
}
