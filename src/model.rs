//! Core domain types shared by every stage.

use anyhow::{Result, anyhow};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use datafusion::arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::engine::columns;

/// The two taxi service variants, each publishing its own source schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaxiType {
    Yellow,
    Green,
}

impl TaxiType {
    pub const ALL: [TaxiType; 2] = [TaxiType::Yellow, TaxiType::Green];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaxiType::Yellow => "yellow",
            TaxiType::Green => "green",
        }
    }
}

impl fmt::Display for TaxiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaxiType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "yellow" => Ok(TaxiType::Yellow),
            "green" => Ok(TaxiType::Green),
            other => Err(anyhow!("unknown taxi type '{other}'")),
        }
    }
}

/// A calendar month, written `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(anyhow!("month out of range: {month}"));
        }
        Ok(Self { year, month })
    }

    pub fn first_day(&self) -> NaiveDate {
        // month is validated on construction
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or_default()
    }

    pub fn days_in_month(&self) -> u32 {
        let (next_year, next_month) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(next_year, next_month, 1)
            .and_then(|d| d.pred_opt())
            .map(|d| d.day())
            .unwrap_or(28)
    }

    /// Returns the date for `day` in this month, if the day exists.
    pub fn date(&self, day: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, day)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| anyhow!("period must be YYYY-MM, got '{s}'"))?;
        if year.len() != 4 || month.len() != 2 {
            return Err(anyhow!("period must be YYYY-MM, got '{s}'"));
        }
        Period::new(year.parse()?, month.parse()?)
    }
}

impl TryFrom<String> for Period {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.to_string()
    }
}

/// File name for a per-period stage table, e.g. `yellow_clean_2025-01.parquet`.
pub fn stage_file_name(taxi_type: TaxiType, tag: &str, period: Period) -> String {
    format!("{}_{}_{}.parquet", taxi_type, tag, period)
}

/// Inverse of [`stage_file_name`].
pub fn parse_stage_file_name(name: &str, tag: &str) -> Option<(TaxiType, Period)> {
    let stem = name.strip_suffix(".parquet")?;
    let (taxi, rest) = stem.split_once('_')?;
    let period = rest.strip_prefix(tag)?.strip_prefix('_')?;
    Some((taxi.parse().ok()?, period.parse().ok()?))
}

/// One canonical trip record, as produced by the schema unifier.
#[derive(Debug, Clone, PartialEq)]
pub struct TripRecord {
    pub pickup_time: NaiveDateTime,
    pub dropoff_time: NaiveDateTime,
    pub pickup_loc: i32,
    pub dropoff_loc: i32,
    pub trip_distance: Option<f64>,
    pub fare: Option<f64>,
    pub total_amount: Option<f64>,
    pub congestion_surcharge: Option<f64>,
    pub taxi_type: TaxiType,
}

impl TripRecord {
    /// Signed trip duration in seconds; negative when dropoff precedes pickup.
    pub fn duration_seconds(&self) -> f64 {
        (self.dropoff_time - self.pickup_time).num_milliseconds() as f64 / 1000.0
    }

    /// Reads canonical records out of query results. Rows with a NULL
    /// required field are rejected, since unified tables never contain them.
    pub fn from_batches(batches: &[RecordBatch]) -> Result<Vec<TripRecord>> {
        let mut records = Vec::new();

        for batch in batches {
            let pickup = columns::timestamps(batch, "pickup_time")?;
            let dropoff = columns::timestamps(batch, "dropoff_time")?;
            let pickup_loc = columns::i64s(batch, "pickup_loc")?;
            let dropoff_loc = columns::i64s(batch, "dropoff_loc")?;
            let distance = columns::f64s(batch, "trip_distance")?;
            let fare = columns::f64s(batch, "fare")?;
            let total = columns::f64s(batch, "total_amount")?;
            let surcharge = columns::f64s(batch, "congestion_surcharge")?;
            let taxi = columns::strings(batch, "taxi_type")?;

            for i in 0..batch.num_rows() {
                let missing = || anyhow!("row {i} has a NULL required field");
                records.push(TripRecord {
                    pickup_time: pickup[i].ok_or_else(missing)?,
                    dropoff_time: dropoff[i].ok_or_else(missing)?,
                    pickup_loc: pickup_loc[i].ok_or_else(missing)? as i32,
                    dropoff_loc: dropoff_loc[i].ok_or_else(missing)? as i32,
                    trip_distance: distance[i],
                    fare: fare[i],
                    total_amount: total[i],
                    congestion_surcharge: surcharge[i],
                    taxi_type: taxi[i].as_deref().ok_or_else(missing)?.parse()?,
                });
            }
        }

        Ok(records)
    }
}
