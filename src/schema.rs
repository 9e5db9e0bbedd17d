//! Schema unification.
//!
//! Yellow and green trip files name the same facts differently. This stage
//! rewrites each raw file into the canonical trip shape:
//!
//! `pickup_time, dropoff_time, pickup_loc, dropoff_loc, trip_distance, fare,
//! total_amount, congestion_surcharge, taxi_type`
//!
//! Values that do not parse as their canonical type become NULL. Rows left
//! without a required field are not dropped: they are written to the
//! malformed audit table with `audit_reason` set to
//! `missing_required_field` (the raw value was absent) or
//! `unparseable_required_field` (it was present but did not parse).

use anyhow::Result;
use datafusion::prelude::SessionContext;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::engine::{self, sql_literal};
use crate::error::{PipelineError, require_upstream};
use crate::ingestion::discover_sources;
use crate::model::{Period, TaxiType, stage_file_name};

pub const UNIFIED_TAG: &str = "unified";
pub const MALFORMED_TAG: &str = "malformed";

/// Canonical column names, in output order (excluding `taxi_type`).
pub const CANONICAL_COLUMNS: [&str; 8] = [
    "pickup_time",
    "dropoff_time",
    "pickup_loc",
    "dropoff_loc",
    "trip_distance",
    "fare",
    "total_amount",
    "congestion_surcharge",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Timestamp,
    ZoneId,
    Amount,
}

impl ColumnKind {
    fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::Timestamp => "TIMESTAMP",
            ColumnKind::ZoneId => "INT",
            ColumnKind::Amount => "DOUBLE",
        }
    }
}

/// How one canonical column is sourced from a raw schema.
#[derive(Debug, Clone, Copy)]
pub struct ColumnMapping {
    pub source: &'static str,
    pub canonical: &'static str,
    kind: ColumnKind,
    pub required: bool,
}

const fn mapping(
    source: &'static str,
    canonical: &'static str,
    kind: ColumnKind,
    required: bool,
) -> ColumnMapping {
    ColumnMapping {
        source,
        canonical,
        kind,
        required,
    }
}

/// Source-to-canonical column map for a taxi type.
pub fn column_map(taxi_type: TaxiType) -> [ColumnMapping; 8] {
    let (pickup, dropoff) = match taxi_type {
        TaxiType::Yellow => ("tpep_pickup_datetime", "tpep_dropoff_datetime"),
        TaxiType::Green => ("lpep_pickup_datetime", "lpep_dropoff_datetime"),
    };
    [
        mapping(pickup, "pickup_time", ColumnKind::Timestamp, true),
        mapping(dropoff, "dropoff_time", ColumnKind::Timestamp, true),
        mapping("PULocationID", "pickup_loc", ColumnKind::ZoneId, true),
        mapping("DOLocationID", "dropoff_loc", ColumnKind::ZoneId, true),
        mapping("trip_distance", "trip_distance", ColumnKind::Amount, false),
        mapping("fare_amount", "fare", ColumnKind::Amount, false),
        mapping("total_amount", "total_amount", ColumnKind::Amount, false),
        mapping("congestion_surcharge", "congestion_surcharge", ColumnKind::Amount, false),
    ]
}

/// Builds the SELECT list mapping `available` source columns onto the
/// canonical shape. Optional columns that are absent become typed NULLs.
/// Values that fail to parse become NULL instead of failing the query.
pub fn build_select(taxi_type: TaxiType, available: &[String], source: &Path) -> Result<String> {
    let mut parts = Vec::new();

    for m in column_map(taxi_type) {
        let present = available.iter().any(|c| c == m.source);
        let expr = if present {
            format!("TRY_CAST(\"{}\" AS {})", m.source, m.kind.sql_type())
        } else if m.required {
            return Err(PipelineError::MissingColumn {
                column: m.source.to_string(),
                path: source.to_path_buf(),
            }
            .into());
        } else {
            format!("CAST(NULL AS {})", m.kind.sql_type())
        };
        parts.push(format!("{expr} AS {}", m.canonical));
    }
    parts.push(format!("{} AS taxi_type", sql_literal(taxi_type.as_str())));

    Ok(format!("SELECT {}", parts.join(",\n       ")))
}

/// True when every required source column holds a raw value, parsed or not.
pub fn raw_required_present(taxi_type: TaxiType) -> String {
    column_map(taxi_type)
        .iter()
        .filter(|m| m.required)
        .map(|m| format!("\"{}\" IS NOT NULL", m.source))
        .collect::<Vec<_>>()
        .join(" AND ")
}

const REQUIRED_PRESENT: &str = "pickup_time IS NOT NULL AND dropoff_time IS NOT NULL \
     AND pickup_loc IS NOT NULL AND dropoff_loc IS NOT NULL";

#[derive(Debug, Clone, Serialize)]
pub struct UnifyOutcome {
    pub taxi_type: TaxiType,
    pub period: Period,
    pub output: PathBuf,
    pub rows: usize,
    pub malformed_rows: usize,
    pub skipped: bool,
}

/// Rewrites one raw file into the canonical shape.
#[tracing::instrument(skip(ctx), fields(input = %input.display()))]
pub async fn unify_file(
    ctx: &SessionContext,
    input: &Path,
    output: &Path,
    malformed_output: &Path,
    taxi_type: TaxiType,
) -> Result<(usize, usize)> {
    let raw = engine::read_source(ctx, input).await?;
    let available: Vec<String> = raw
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().to_string())
        .collect();
    ctx.register_table("raw_trips", raw.into_view())?;

    let select = build_select(taxi_type, &available, input)?;
    let raw_present = raw_required_present(taxi_type);
    engine::register_view(
        ctx,
        "canonical",
        &format!("{select},\n       {raw_present} AS raw_complete\nFROM raw_trips"),
    )
    .await?;

    let columns = CANONICAL_COLUMNS.join(", ");
    let rows = engine::copy_to_parquet(
        ctx,
        &format!("SELECT {columns}, taxi_type FROM canonical WHERE {REQUIRED_PRESENT}"),
        output,
    )
    .await?;

    let malformed = engine::copy_to_parquet(
        ctx,
        &format!(
            "SELECT {columns}, taxi_type, \
             CASE WHEN raw_complete THEN 'unparseable_required_field' \
             ELSE 'missing_required_field' END AS audit_reason \
             FROM canonical WHERE NOT ({REQUIRED_PRESENT})"
        ),
        malformed_output,
    )
    .await?;

    ctx.deregister_table("canonical")?;
    ctx.deregister_table("raw_trips")?;

    if malformed > 0 {
        warn!(malformed, "Rows with missing or unparseable required fields diverted to audit");
    }
    info!(rows, "Unified");
    Ok((rows, malformed))
}

/// Unifies every raw file found under `raw/`.
#[tracing::instrument(skip_all)]
pub async fn unify_all(config: &PipelineConfig) -> Result<Vec<UnifyOutcome>> {
    let layout = config.layout();
    require_upstream("unify", &layout.raw_dir)?;
    let ctx = engine::session(&config.engine)?;

    let mut outcomes = Vec::new();
    for (taxi_type, period, input) in discover_sources(&layout)? {
        let output = layout
            .unified_dir
            .join(stage_file_name(taxi_type, UNIFIED_TAG, period));
        let malformed_output = layout
            .malformed_dir
            .join(stage_file_name(taxi_type, MALFORMED_TAG, period));

        if output.exists() && !config.overwrite {
            info!(output = %output.display(), "Already unified, skipping");
            outcomes.push(UnifyOutcome {
                taxi_type,
                period,
                output,
                rows: 0,
                malformed_rows: 0,
                skipped: true,
            });
            continue;
        }

        let (rows, malformed_rows) =
            unify_file(&ctx, &input, &output, &malformed_output, taxi_type).await?;
        outcomes.push(UnifyOutcome {
            taxi_type,
            period,
            output,
            rows,
            malformed_rows,
            skipped: false,
        });
    }

    info!(
        files = outcomes.len(),
        rows = outcomes.iter().map(|o| o.rows).sum::<usize>(),
        "Schema unification complete"
    );
    Ok(outcomes)
}

/// Checks that a unified table carries every canonical column.
pub async fn verify_unified_schema(ctx: &SessionContext, path: &Path) -> Result<()> {
    let df = engine::read_parquet_files(ctx, &[path.to_path_buf()]).await?;
    let schema = df.schema();
    for column in CANONICAL_COLUMNS.iter().chain(std::iter::once(&"taxi_type")) {
        if !schema.fields().iter().any(|f| f.name() == column) {
            return Err(PipelineError::MissingColumn {
                column: column.to_string(),
                path: path.to_path_buf(),
            }
            .into());
        }
    }
    Ok(())
}
