//! Parquet file decoding into loosely typed column maps.

use arrow_array::cast::AsArray;
use arrow_array::types::{
    Date32Type, Decimal128Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type,
    Int8Type, TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use arrow_array::{Array, RecordBatch};
use arrow_schema::{DataType, TimeUnit};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::{Map, Number, Value as JsonValue};
use tracing::debug;

use crate::FeedError;

/// Days between 0001-01-01 (CE day 1) and the Unix epoch.
const UNIX_EPOCH_FROM_CE: i32 = 719_163;

/// Decodes an entire parquet file into one JSON object per row.
pub fn decode_parquet(bytes: Bytes) -> Result<Vec<Map<String, JsonValue>>, FeedError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
    let mut rows = Vec::new();
    for batch in reader {
        rows.extend(batch_to_columns(&batch?));
    }
    Ok(rows)
}

/// Columns with a type we cannot express as JSON are left out of every row.
pub fn batch_to_columns(batch: &RecordBatch) -> Vec<Map<String, JsonValue>> {
    let schema = batch.schema();
    let mut rows = vec![Map::new(); batch.num_rows()];
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        if !is_supported(column.data_type()) {
            debug!(column = field.name().as_str(), data_type = %column.data_type(), "skipping column");
            continue;
        }
        for (idx, row) in rows.iter_mut().enumerate() {
            row.insert(field.name().clone(), cell_value(column.as_ref(), idx));
        }
    }
    rows
}

fn is_supported(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Null
            | DataType::Utf8
            | DataType::LargeUtf8
            | DataType::Boolean
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
            | DataType::Decimal128(_, _)
            | DataType::Date32
            | DataType::Timestamp(_, _)
    )
}

fn float(v: f64) -> JsonValue {
    Number::from_f64(v).map(JsonValue::Number).unwrap_or(JsonValue::Null)
}

fn cell_value(array: &dyn Array, idx: usize) -> JsonValue {
    if array.is_null(idx) {
        return JsonValue::Null;
    }
    match array.data_type() {
        DataType::Utf8 => JsonValue::String(array.as_string::<i32>().value(idx).to_string()),
        DataType::LargeUtf8 => JsonValue::String(array.as_string::<i64>().value(idx).to_string()),
        DataType::Boolean => JsonValue::Bool(array.as_boolean().value(idx)),
        DataType::Int8 => array.as_primitive::<Int8Type>().value(idx).into(),
        DataType::Int16 => array.as_primitive::<Int16Type>().value(idx).into(),
        DataType::Int32 => array.as_primitive::<Int32Type>().value(idx).into(),
        DataType::Int64 => array.as_primitive::<Int64Type>().value(idx).into(),
        DataType::UInt8 => array.as_primitive::<UInt8Type>().value(idx).into(),
        DataType::UInt16 => array.as_primitive::<UInt16Type>().value(idx).into(),
        DataType::UInt32 => array.as_primitive::<UInt32Type>().value(idx).into(),
        DataType::UInt64 => array.as_primitive::<UInt64Type>().value(idx).into(),
        DataType::Float32 => float(f64::from(array.as_primitive::<Float32Type>().value(idx))),
        DataType::Float64 => float(array.as_primitive::<Float64Type>().value(idx)),
        DataType::Decimal128(_, scale) => {
            let raw = array.as_primitive::<Decimal128Type>().value(idx);
            float(raw as f64 / 10f64.powi(i32::from(*scale)))
        }
        DataType::Date32 => {
            let days = array.as_primitive::<Date32Type>().value(idx);
            NaiveDate::from_num_days_from_ce_opt(days.saturating_add(UNIX_EPOCH_FROM_CE))
                .map(|d| JsonValue::String(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(JsonValue::Null)
        }
        DataType::Timestamp(unit, _) => {
            let micros = match unit {
                TimeUnit::Second => array
                    .as_primitive::<TimestampSecondType>()
                    .value(idx)
                    .saturating_mul(1_000_000),
                TimeUnit::Millisecond => array
                    .as_primitive::<TimestampMillisecondType>()
                    .value(idx)
                    .saturating_mul(1_000),
                TimeUnit::Microsecond => array.as_primitive::<TimestampMicrosecondType>().value(idx),
                TimeUnit::Nanosecond => array.as_primitive::<TimestampNanosecondType>().value(idx) / 1_000,
            };
            DateTime::from_timestamp_micros(micros)
                .map(|ts| JsonValue::String(ts.to_rfc3339()))
                .unwrap_or(JsonValue::Null)
        }
        _ => JsonValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_array::{
        BooleanArray, Float64Array, Int64Array, StringArray, StructArray, TimestampMillisecondArray,
    };
    use arrow_schema::{Field, Fields, Schema};
    use parquet::arrow::ArrowWriter;

    use super::*;
    use crate::{ChangeRecord, ImpliedMeta};
    use giga_core::ChangeType;

    fn feed_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("school_id_giga", DataType::Utf8, true),
            Field::new("school_name", DataType::Utf8, true),
            Field::new("num_students", DataType::Int64, true),
            Field::new("latitude", DataType::Float64, true),
            Field::new("connectivity", DataType::Boolean, true),
            Field::new("_change_type", DataType::Utf8, false),
            Field::new("_commit_version", DataType::Int64, false),
            Field::new(
                "_commit_timestamp",
                DataType::Timestamp(TimeUnit::Millisecond, None),
                false,
            ),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("S1"), None])),
                Arc::new(StringArray::from(vec![Some("Escola A"), Some("orphan")])),
                Arc::new(Int64Array::from(vec![Some(320), None])),
                Arc::new(Float64Array::from(vec![Some(-15.79), Some(0.0)])),
                Arc::new(BooleanArray::from(vec![Some(true), None])),
                Arc::new(StringArray::from(vec!["insert", "insert"])),
                Arc::new(Int64Array::from(vec![10, 10])),
                Arc::new(TimestampMillisecondArray::from(vec![
                    1_714_521_600_000,
                    1_714_521_600_000,
                ])),
            ],
        )
        .expect("batch")
    }

    fn to_parquet(batch: &RecordBatch) -> Bytes {
        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None).expect("writer");
        writer.write(batch).expect("write");
        writer.close().expect("close");
        Bytes::from(buf)
    }

    #[test]
    fn parquet_rows_decode_into_change_records() {
        let rows = decode_parquet(to_parquet(&feed_batch())).expect("decode");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["num_students"], JsonValue::from(320));
        assert_eq!(rows[0]["connectivity"], JsonValue::Bool(true));
        assert_eq!(rows[1]["school_id_giga"], JsonValue::Null);

        let records: Vec<_> = rows
            .into_iter()
            .filter_map(|row| ChangeRecord::from_columns(row, ImpliedMeta::default()).expect("row"))
            .collect();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.change_type, ChangeType::Insert);
        assert_eq!(record.commit_version, Some(10));
        assert_eq!(
            record.commit_timestamp.map(|t| t.timestamp_millis()),
            Some(1_714_521_600_000)
        );
        assert_eq!(record.row.school_name.as_deref(), Some("Escola A"));
        assert_eq!(record.row.num_students, Some(320));
        assert_eq!(record.row.connectivity.as_deref(), Some("true"));
    }

    #[test]
    fn nested_columns_are_left_out() {
        let inner = Fields::from(vec![Field::new("a", DataType::Int64, true)]);
        let nested = StructArray::new(
            inner.clone(),
            vec![Arc::new(Int64Array::from(vec![Some(1)])) as Arc<dyn Array>],
            None,
        );
        let schema = Arc::new(Schema::new(vec![
            Field::new("school_id_giga", DataType::Utf8, false),
            Field::new("extra", DataType::Struct(inner), true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(StringArray::from(vec!["S1"])), Arc::new(nested)],
        )
        .expect("batch");

        let rows = batch_to_columns(&batch);
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].contains_key("extra"));
    }
}
