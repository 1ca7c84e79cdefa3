//! Conversions between PostgreSQL result rows and polars frames.
//!
//! The supported column types are the intersection of what user tables
//! realistically hold and what round-trips losslessly: integers map to
//! Int64, floating point to Float64, text to String, booleans to
//! Boolean, and timestamps to Datetime with microsecond precision.
//! Anything else is a structured error naming the column, never a
//! silent coercion.

use chrono::{DateTime, NaiveDateTime, Utc};
use polars::prelude::*;
use sqlx::postgres::PgRow;
use sqlx::{Column as _, Row as _, TypeInfo as _};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("column '{column}' has unsupported data type {type_name}")]
    UnsupportedColumnType { column: String, type_name: String },
    #[error("failed to decode column '{column}': {error}")]
    Decode { column: String, error: sqlx::Error },
    #[error("frame error: {0}")]
    Polars(#[from] PolarsError),
}

/// One cell of a frame flattened for binding into an INSERT.
#[derive(Debug, Clone)]
pub enum CellValue {
    Int(Option<i64>),
    Float(Option<f64>),
    Bool(Option<bool>),
    Str(Option<String>),
    Timestamp(Option<NaiveDateTime>),
}

enum ColumnBuilder {
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Bool(Vec<Option<bool>>),
    Str(Vec<Option<String>>),
    // microseconds since the Unix epoch, UTC
    Timestamp(Vec<Option<i64>>),
}

impl ColumnBuilder {
    fn for_pg_type(type_name: &str) -> Option<Self> {
        match type_name {
            "INT2" | "INT4" | "INT8" => Some(Self::Int(Vec::new())),
            "FLOAT4" | "FLOAT8" => Some(Self::Float(Vec::new())),
            "BOOL" => Some(Self::Bool(Vec::new())),
            "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" => Some(Self::Str(Vec::new())),
            "TIMESTAMP" | "TIMESTAMPTZ" => Some(Self::Timestamp(Vec::new())),
            _ => None,
        }
    }

    fn push(&mut self, row: &PgRow, index: usize, type_name: &str) -> Result<(), sqlx::Error> {
        match self {
            Self::Int(values) => {
                let value = match type_name {
                    "INT2" => row.try_get::<Option<i16>, _>(index)?.map(i64::from),
                    "INT4" => row.try_get::<Option<i32>, _>(index)?.map(i64::from),
                    _ => row.try_get::<Option<i64>, _>(index)?,
                };
                values.push(value);
            }
            Self::Float(values) => {
                let value = match type_name {
                    "FLOAT4" => row.try_get::<Option<f32>, _>(index)?.map(f64::from),
                    _ => row.try_get::<Option<f64>, _>(index)?,
                };
                values.push(value);
            }
            Self::Bool(values) => values.push(row.try_get::<Option<bool>, _>(index)?),
            Self::Str(values) => values.push(row.try_get::<Option<String>, _>(index)?),
            Self::Timestamp(values) => {
                let micros = match type_name {
                    "TIMESTAMPTZ" => row
                        .try_get::<Option<DateTime<Utc>>, _>(index)?
                        .map(|ts| ts.timestamp_micros()),
                    _ => row
                        .try_get::<Option<NaiveDateTime>, _>(index)?
                        .map(|ts| ts.and_utc().timestamp_micros()),
                };
                values.push(micros);
            }
        }
        Ok(())
    }

    fn finish(self, name: &str) -> Column {
        match self {
            Self::Int(values) => Series::new(name.into(), values).into_column(),
            Self::Float(values) => Series::new(name.into(), values).into_column(),
            Self::Bool(values) => Series::new(name.into(), values).into_column(),
            Self::Str(values) => Series::new(name.into(), values).into_column(),
            Self::Timestamp(values) => values
                .into_iter()
                .collect::<Int64Chunked>()
                .with_name(name.into())
                .into_datetime(TimeUnit::Microseconds, None)
                .into_series()
                .into_column(),
        }
    }
}

/// Build a frame out of a uniform set of PostgreSQL rows.
///
/// An empty row set yields an empty frame; the caller decides whether
/// that is an error in its context.
pub fn frame_from_rows(rows: &[PgRow]) -> Result<DataFrame, FrameError> {
    let Some(first) = rows.first() else {
        return Ok(DataFrame::empty());
    };

    let mut names = Vec::with_capacity(first.columns().len());
    let mut type_names = Vec::with_capacity(first.columns().len());
    let mut builders = Vec::with_capacity(first.columns().len());

    for column in first.columns() {
        let type_name = column.type_info().name().to_owned();
        let builder = ColumnBuilder::for_pg_type(&type_name).ok_or_else(|| {
            FrameError::UnsupportedColumnType {
                column: column.name().to_owned(),
                type_name: type_name.clone(),
            }
        })?;
        names.push(column.name().to_owned());
        type_names.push(type_name);
        builders.push(builder);
    }

    for row in rows {
        for (index, builder) in builders.iter_mut().enumerate() {
            builder
                .push(row, index, &type_names[index])
                .map_err(|error| FrameError::Decode {
                    column: names[index].clone(),
                    error,
                })?;
        }
    }

    let columns = builders
        .into_iter()
        .zip(names.iter())
        .map(|(builder, name)| builder.finish(name))
        .collect::<Vec<_>>();

    Ok(DataFrame::new(columns)?)
}

/// PostgreSQL DDL type for a (normalized) polars dtype.
pub fn pg_type_for_dtype(column: &str, dtype: &DataType) -> Result<&'static str, FrameError> {
    match dtype {
        DataType::Int64 => Ok("BIGINT"),
        DataType::Float64 => Ok("DOUBLE PRECISION"),
        DataType::Boolean => Ok("BOOLEAN"),
        DataType::String => Ok("TEXT"),
        DataType::Datetime(_, _) => Ok("TIMESTAMPTZ"),
        other => Err(FrameError::UnsupportedColumnType {
            column: column.to_owned(),
            type_name: format!("{other:?}"),
        }),
    }
}

/// Widen narrow numeric dtypes so the write path only deals with the
/// canonical set. Returns a new frame; the input is untouched.
pub fn normalize_for_write(df: &DataFrame) -> Result<DataFrame, FrameError> {
    let mut columns = Vec::with_capacity(df.width());
    for column in df.get_columns() {
        let series = column.as_materialized_series();
        let normalized = match series.dtype() {
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => series.cast(&DataType::Int64)?,
            DataType::Float32 => series.cast(&DataType::Float64)?,
            DataType::Int64
            | DataType::Float64
            | DataType::Boolean
            | DataType::String
            | DataType::Datetime(_, _) => series.clone(),
            other => {
                return Err(FrameError::UnsupportedColumnType {
                    column: series.name().to_string(),
                    type_name: format!("{other:?}"),
                })
            }
        };
        columns.push(normalized.into_column());
    }
    Ok(DataFrame::new(columns)?)
}

/// Flatten a (normalized) frame into column-major cells for binding.
pub fn materialize_cells(df: &DataFrame) -> Result<Vec<Vec<CellValue>>, FrameError> {
    let mut out = Vec::with_capacity(df.width());
    for column in df.get_columns() {
        let series = column.as_materialized_series();
        let cells = match series.dtype() {
            DataType::Int64 => series
                .i64()?
                .into_iter()
                .map(CellValue::Int)
                .collect::<Vec<_>>(),
            DataType::Float64 => series
                .f64()?
                .into_iter()
                .map(CellValue::Float)
                .collect::<Vec<_>>(),
            DataType::Boolean => series
                .bool()?
                .into_iter()
                .map(CellValue::Bool)
                .collect::<Vec<_>>(),
            DataType::String => series
                .str()?
                .into_iter()
                .map(|value| CellValue::Str(value.map(str::to_owned)))
                .collect::<Vec<_>>(),
            DataType::Datetime(_, _) => series
                .cast(&DataType::Int64)?
                .i64()?
                .into_iter()
                .map(|micros| CellValue::Timestamp(micros.map(naive_from_micros)))
                .collect::<Vec<_>>(),
            other => {
                return Err(FrameError::UnsupportedColumnType {
                    column: series.name().to_string(),
                    type_name: format!("{other:?}"),
                })
            }
        };
        out.push(cells);
    }
    Ok(out)
}

fn naive_from_micros(micros: i64) -> NaiveDateTime {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .naive_utc()
}

/// Column names as owned strings, in frame order.
pub fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_widens_small_ints() {
        let df = DataFrame::new(vec![
            Series::new("a".into(), &[1i32, 2, 3]).into_column(),
            Series::new("b".into(), &[1.5f32, 2.5, 3.5]).into_column(),
        ])
        .unwrap();

        let normalized = normalize_for_write(&df).unwrap();
        assert_eq!(normalized.column("a").unwrap().dtype(), &DataType::Int64);
        assert_eq!(normalized.column("b").unwrap().dtype(), &DataType::Float64);
    }

    #[test]
    fn test_materialize_preserves_nulls() {
        let df = DataFrame::new(vec![Series::new(
            "a".into(),
            &[Some(10i64), None, Some(30)],
        )
        .into_column()])
        .unwrap();

        let cells = materialize_cells(&df).unwrap();
        assert_eq!(cells.len(), 1);
        assert!(matches!(cells[0][0], CellValue::Int(Some(10))));
        assert!(matches!(cells[0][1], CellValue::Int(None)));
        assert!(matches!(cells[0][2], CellValue::Int(Some(30))));
    }

    #[test]
    fn test_pg_type_rejects_nested_dtypes() {
        let err = pg_type_for_dtype("a", &DataType::List(Box::new(DataType::Int64)));
        assert!(err.is_err());
    }
}
