//! Typed column readers over query results.
//!
//! Every reader casts the column to one Arrow type first, so callers do not
//! care whether the engine produced `Int32` or `Int64`, `Utf8` or `Utf8View`.

use anyhow::{Result, anyhow};
use chrono::NaiveDateTime;
use datafusion::arrow::array::{Array, ArrayRef};
use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::{DataType, TimeUnit};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::common::cast::{
    as_float64_array, as_int64_array, as_string_array, as_timestamp_microsecond_array,
};

fn column_as(batch: &RecordBatch, name: &str, to: &DataType) -> Result<ArrayRef> {
    let array = batch
        .column_by_name(name)
        .ok_or_else(|| anyhow!("column `{name}` missing from query result"))?;
    Ok(cast(array, to)?)
}

pub fn f64s(batch: &RecordBatch, name: &str) -> Result<Vec<Option<f64>>> {
    let array = column_as(batch, name, &DataType::Float64)?;
    Ok(as_float64_array(&array)?.iter().collect())
}

pub fn i64s(batch: &RecordBatch, name: &str) -> Result<Vec<Option<i64>>> {
    let array = column_as(batch, name, &DataType::Int64)?;
    Ok(as_int64_array(&array)?.iter().collect())
}

pub fn strings(batch: &RecordBatch, name: &str) -> Result<Vec<Option<String>>> {
    let array = column_as(batch, name, &DataType::Utf8)?;
    Ok(as_string_array(&array)?
        .iter()
        .map(|v| v.map(str::to_string))
        .collect())
}

pub fn timestamps(batch: &RecordBatch, name: &str) -> Result<Vec<Option<NaiveDateTime>>> {
    let array = column_as(batch, name, &DataType::Timestamp(TimeUnit::Microsecond, None))?;
    let times = as_timestamp_microsecond_array(&array)?;
    Ok((0..times.len())
        .map(|i| {
            if times.is_null(i) {
                None
            } else {
                times.value_as_datetime(i)
            }
        })
        .collect())
}

/// Flattens one column across a set of batches.
pub fn gather<T>(
    batches: &[RecordBatch],
    name: &str,
    read: fn(&RecordBatch, &str) -> Result<Vec<T>>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for batch in batches {
        out.extend(read(batch, name)?);
    }
    Ok(out)
}

/// Reads a single non-null integer from a one-row aggregate result.
pub fn scalar_i64(batches: &[RecordBatch], name: &str) -> Result<i64> {
    gather(batches, name, i64s)?
        .into_iter()
        .next()
        .flatten()
        .ok_or_else(|| anyhow!("aggregate `{name}` returned no value"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{Float64Array, Int32Array, StringArray};
    use datafusion::arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("zone", DataType::Int32, true),
            Field::new("fare", DataType::Float64, true),
            Field::new("name", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![Some(4), None])),
                Arc::new(Float64Array::from(vec![Some(12.5), Some(-1.0)])),
                Arc::new(StringArray::from(vec![Some("Alphabet City"), None])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_readers_cast_and_keep_nulls() {
        let b = batch();
        assert_eq!(i64s(&b, "zone").unwrap(), vec![Some(4), None]);
        assert_eq!(f64s(&b, "fare").unwrap(), vec![Some(12.5), Some(-1.0)]);
        assert_eq!(
            strings(&b, "name").unwrap(),
            vec![Some("Alphabet City".to_string()), None]
        );
        // integers widen to floats
        assert_eq!(f64s(&b, "zone").unwrap(), vec![Some(4.0), None]);
    }

    #[test]
    fn test_missing_column_is_error() {
        assert!(f64s(&batch(), "nope").is_err());
    }

    #[test]
    fn test_gather_and_scalar() {
        let b = batch();
        let zones = gather(&[b.clone(), b.clone()], "zone", i64s).unwrap();
        assert_eq!(zones.len(), 4);
        assert_eq!(scalar_i64(&[b], "zone").unwrap(), 4);
    }
}
