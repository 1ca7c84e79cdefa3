//! Reads and writes against externally managed user tables.
//!
//! Every operation validates table identifiers before they touch SQL
//! text; cell values always go through parameter binding. This is the
//! only module that interpolates identifiers, and only after they pass
//! the checks in [`crate::ident`].

use std::collections::BTreeSet;

use polars::prelude::*;
use sqlx::postgres::PgPool;
use sqlx::QueryBuilder;
use thiserror::Error;
use tracing::debug;

use crate::frame::{self, CellValue, FrameError};
use crate::ident;

/// Rows per INSERT batch.
const INSERT_BATCH_ROWS: usize = 10_000;

/// PostgreSQL caps bind parameters at u16::MAX per statement.
const PG_BIND_LIMIT: usize = 65_000;

/// Upper bound a preview may request.
const PREVIEW_MAX_ROWS: i64 = 1_000;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid table name: {0}")]
    InvalidName(String),
    #[error("invalid column name: {0}")]
    InvalidColumn(String),
    #[error("cannot write an empty frame")]
    EmptyOutput,
    #[error("output exceeds maximum rows ({rows} > {limit})")]
    OutputTooLarge { rows: usize, limit: usize },
    #[error("table '{0}' already exists")]
    TableExists(String),
    #[error("{command} query failed with: {error}")]
    Query { command: String, error: sqlx::Error },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// How to treat an existing destination table on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Replace,
    Append,
    Fail,
}

#[derive(Debug)]
pub struct TablePreview {
    pub total_rows: i64,
    pub columns: Vec<String>,
    pub rows: DataFrame,
}

/// One column of a table schema listing.
#[derive(Debug, sqlx::FromRow)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

#[derive(Clone)]
pub struct DataStore {
    pool: PgPool,
    max_output_rows: usize,
    chunk_size: usize,
}

impl DataStore {
    pub fn new(pool: PgPool, max_output_rows: usize, chunk_size: usize) -> Self {
        Self {
            pool,
            max_output_rows,
            chunk_size,
        }
    }

    /// All base tables in the public schema, minus the platform's own.
    pub async fn list_tables(&self) -> Result<BTreeSet<String>, StoreError> {
        let names: Vec<(String,)> = sqlx::query_as(
            r#"
SELECT table_name
FROM information_schema.tables
WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "SELECT".to_owned(),
            error,
        })?;

        Ok(names
            .into_iter()
            .map(|(name,)| name)
            .filter(|name| {
                let lowered = name.to_lowercase();
                !ident::RESERVED_TABLES.contains(&lowered.as_str())
                    && !ident::RESERVED_PREFIXES
                        .iter()
                        .any(|prefix| lowered.starts_with(prefix))
            })
            .collect())
    }

    /// Ordered column listing for a table.
    pub async fn schema(&self, table: &str) -> Result<Vec<ColumnSchema>, StoreError> {
        self.validate_source(table)?;

        sqlx::query_as(
            r#"
SELECT
    column_name AS name,
    data_type,
    (is_nullable = 'YES') AS nullable,
    column_default AS "default"
FROM information_schema.columns
WHERE table_schema = 'public' AND table_name = $1
ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "SELECT".to_owned(),
            error,
        })
    }

    pub async fn row_count(&self, table: &str) -> Result<i64, StoreError> {
        self.validate_source(table)?;

        let query = format!("SELECT COUNT(*) FROM {}", ident::quote(table));
        let (count,): (i64,) =
            sqlx::query_as(&query)
                .fetch_one(&self.pool)
                .await
                .map_err(|error| StoreError::Query {
                    command: "SELECT".to_owned(),
                    error,
                })?;

        Ok(count)
    }

    /// Total row count plus the first `limit` rows (capped at 1,000).
    pub async fn preview(&self, table: &str, limit: i64) -> Result<TablePreview, StoreError> {
        let total_rows = self.row_count(table).await?;
        let rows = self
            .read_chunk(table, limit.clamp(0, PREVIEW_MAX_ROWS), 0)
            .await?;

        Ok(TablePreview {
            total_rows,
            columns: frame::column_names(&rows),
            rows,
        })
    }

    /// Read one LIMIT/OFFSET slice of a table.
    ///
    /// Ordering is whatever the database produces; callers that need a
    /// stable order across calls must add their own sort key. The
    /// chunked pipeline tolerates this because chunks are transformed
    /// independently and appended in the order produced.
    pub async fn read_chunk(
        &self,
        table: &str,
        limit: i64,
        offset: i64,
    ) -> Result<DataFrame, StoreError> {
        self.validate_source(table)?;

        let query = format!("SELECT * FROM {} LIMIT $1 OFFSET $2", ident::quote(table));
        let rows = sqlx::query(&query)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(frame::frame_from_rows(&rows)?)
    }

    /// Read a whole table, accumulating chunk-wise past the chunk size.
    pub async fn read_table(&self, table: &str) -> Result<DataFrame, StoreError> {
        let total = self.row_count(table).await?;

        if total as usize <= self.chunk_size {
            self.validate_source(table)?;
            let query = format!("SELECT * FROM {}", ident::quote(table));
            let rows = sqlx::query(&query)
                .fetch_all(&self.pool)
                .await
                .map_err(|error| StoreError::Query {
                    command: "SELECT".to_owned(),
                    error,
                })?;
            return Ok(frame::frame_from_rows(&rows)?);
        }

        let mut accumulated: Option<DataFrame> = None;
        let mut offset = 0i64;
        loop {
            let chunk = self
                .read_chunk(table, self.chunk_size as i64, offset)
                .await?;
            if chunk.height() == 0 {
                break;
            }
            offset += chunk.height() as i64;
            accumulated = match accumulated {
                None => Some(chunk),
                Some(mut base) => {
                    base.vstack_mut(&chunk).map_err(FrameError::from)?;
                    Some(base)
                }
            };
            if offset >= total {
                break;
            }
        }

        Ok(accumulated.unwrap_or_else(DataFrame::empty))
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
SELECT EXISTS (
    SELECT FROM information_schema.tables
    WHERE table_schema = 'public' AND table_name = $1
)
            "#,
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "SELECT".to_owned(),
            error,
        })?;

        Ok(exists)
    }

    /// Write a frame to a destination table, creating or extending it.
    ///
    /// Rejects empty frames, frames above the configured row cap, and
    /// any column name failing the identifier rule. Inserts run in
    /// batches of [`INSERT_BATCH_ROWS`] rows.
    pub async fn write_table(
        &self,
        df: &DataFrame,
        table: &str,
        mode: WriteMode,
    ) -> Result<u64, StoreError> {
        if !ident::is_valid_destination_table(table) {
            return Err(StoreError::InvalidName(table.to_owned()));
        }
        if df.height() == 0 {
            return Err(StoreError::EmptyOutput);
        }
        if df.height() > self.max_output_rows {
            return Err(StoreError::OutputTooLarge {
                rows: df.height(),
                limit: self.max_output_rows,
            });
        }
        for name in df.get_column_names() {
            if !ident::is_valid_column_name(name.as_str()) {
                return Err(StoreError::InvalidColumn(name.to_string()));
            }
        }

        let df = frame::normalize_for_write(df)?;
        self.prepare_destination(&df, table, mode).await?;

        let quoted_table = ident::quote(table);
        let column_list = df
            .get_column_names()
            .iter()
            .map(|name| ident::quote(name.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        // Stay under both the row batch size and the bind-parameter cap.
        let rows_per_insert = (PG_BIND_LIMIT / df.width().max(1)).min(INSERT_BATCH_ROWS);

        let mut rows_written = 0u64;
        let mut offset = 0usize;
        while offset < df.height() {
            let batch = df.slice(offset as i64, rows_per_insert);
            let cells = frame::materialize_cells(&batch)?;

            let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {quoted_table} ({column_list}) "
            ));
            builder.push_values(0..batch.height(), |mut row_binds, row| {
                for column in &cells {
                    match &column[row] {
                        CellValue::Int(value) => row_binds.push_bind(*value),
                        CellValue::Float(value) => row_binds.push_bind(*value),
                        CellValue::Bool(value) => row_binds.push_bind(*value),
                        CellValue::Str(value) => row_binds.push_bind(value.clone()),
                        CellValue::Timestamp(value) => row_binds.push_bind(*value),
                    };
                }
            });

            builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(|error| StoreError::Query {
                    command: "INSERT".to_owned(),
                    error,
                })?;

            rows_written += batch.height() as u64;
            offset += batch.height();
        }

        debug!(table, rows = rows_written, "wrote frame to table");
        Ok(rows_written)
    }

    fn validate_source(&self, table: &str) -> Result<(), StoreError> {
        if ident::is_valid_table_name(table) {
            Ok(())
        } else {
            Err(StoreError::InvalidName(table.to_owned()))
        }
    }

    async fn prepare_destination(
        &self,
        df: &DataFrame,
        table: &str,
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        let exists = self.table_exists(table).await?;

        match mode {
            WriteMode::Fail if exists => return Err(StoreError::TableExists(table.to_owned())),
            WriteMode::Replace if exists => {
                let drop = format!("DROP TABLE IF EXISTS {}", ident::quote(table));
                sqlx::query(&drop)
                    .execute(&self.pool)
                    .await
                    .map_err(|error| StoreError::Query {
                        command: "DROP".to_owned(),
                        error,
                    })?;
            }
            WriteMode::Append if exists => return Ok(()),
            _ => {}
        }

        let column_defs = df
            .get_columns()
            .iter()
            .map(|column| {
                let name = column.name().as_str();
                let pg_type = frame::pg_type_for_dtype(name, column.dtype())?;
                Ok(format!("{} {}", ident::quote(name), pg_type))
            })
            .collect::<Result<Vec<_>, FrameError>>()?
            .join(", ");

        let create = format!("CREATE TABLE {} ({})", ident::quote(table), column_defs);
        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "CREATE".to_owned(),
                error,
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    fn store(pool: PgPool) -> DataStore {
        DataStore::new(pool, 1_000_000, 50_000)
    }

    fn sales_frame() -> DataFrame {
        DataFrame::new(vec![
            Series::new("price".into(), &[10i64, 20, 30]).into_column(),
            Series::new("qty".into(), &[2i64, 3, 4]).into_column(),
        ])
        .unwrap()
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_write_then_read_roundtrip(pool: PgPool) {
        let store = store(pool);
        let df = sales_frame();

        let written = store
            .write_table(&df, "ds_sales", WriteMode::Replace)
            .await
            .unwrap();
        assert_eq!(written, 3);

        let read = store.read_table("ds_sales").await.unwrap();
        assert_eq!(read.height(), 3);
        assert_eq!(frame::column_names(&read), vec!["price", "qty"]);

        let prices: Vec<Option<i64>> = read
            .column("price")
            .unwrap()
            .as_materialized_series()
            .i64()
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(prices, vec![Some(10), Some(20), Some(30)]);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_write_rejects_empty_frame(pool: PgPool) {
        let store = store(pool);
        let result = store
            .write_table(&DataFrame::empty(), "ds_empty", WriteMode::Replace)
            .await;
        assert!(matches!(result, Err(StoreError::EmptyOutput)));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_write_rejects_reserved_destination(pool: PgPool) {
        let store = store(pool);
        let result = store
            .write_table(&sales_frame(), "jobs", WriteMode::Replace)
            .await;
        assert!(matches!(result, Err(StoreError::InvalidName(_))));

        let result = store
            .write_table(&sales_frame(), "pg_shadow", WriteMode::Replace)
            .await;
        assert!(matches!(result, Err(StoreError::InvalidName(_))));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_write_enforces_row_cap(pool: PgPool) {
        let store = DataStore::new(pool, 2, 50_000);
        let result = store
            .write_table(&sales_frame(), "ds_capped", WriteMode::Replace)
            .await;
        assert!(matches!(
            result,
            Err(StoreError::OutputTooLarge { rows: 3, limit: 2 })
        ));

        let two_rows = sales_frame().slice(0, 2);
        let written = store
            .write_table(&two_rows, "ds_capped", WriteMode::Replace)
            .await
            .unwrap();
        assert_eq!(written, 2);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_append_accumulates_and_fail_mode_rejects(pool: PgPool) {
        let store = store(pool);
        let df = sales_frame();

        store
            .write_table(&df, "ds_grow", WriteMode::Replace)
            .await
            .unwrap();
        store
            .write_table(&df, "ds_grow", WriteMode::Append)
            .await
            .unwrap();
        assert_eq!(store.row_count("ds_grow").await.unwrap(), 6);

        let result = store.write_table(&df, "ds_grow", WriteMode::Fail).await;
        assert!(matches!(result, Err(StoreError::TableExists(_))));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_read_chunk_respects_limit_and_offset(pool: PgPool) {
        let store = store(pool);
        store
            .write_table(&sales_frame(), "ds_chunked", WriteMode::Replace)
            .await
            .unwrap();

        let chunk = store.read_chunk("ds_chunked", 2, 2).await.unwrap();
        assert_eq!(chunk.height(), 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_preview_reports_total(pool: PgPool) {
        let store = store(pool);
        store
            .write_table(&sales_frame(), "ds_preview", WriteMode::Replace)
            .await
            .unwrap();

        let preview = store.preview("ds_preview", 2).await.unwrap();
        assert_eq!(preview.total_rows, 3);
        assert_eq!(preview.rows.height(), 2);
        assert_eq!(preview.columns, vec!["price", "qty"]);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_list_tables_excludes_platform_tables(pool: PgPool) {
        let store = store(pool);
        store
            .write_table(&sales_frame(), "ds_listed", WriteMode::Replace)
            .await
            .unwrap();

        let tables = store.list_tables().await.unwrap();
        assert!(tables.contains("ds_listed"));
        assert!(!tables.contains("jobs"));
        assert!(!tables.contains("users"));
        assert!(!tables.contains("scripts"));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_row_count_rejects_invalid_name(pool: PgPool) {
        let store = store(pool);
        let result = store.row_count("not a table; --").await;
        assert!(matches!(result, Err(StoreError::InvalidName(_))));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_write_rejects_invalid_column_name(pool: PgPool) {
        let store = store(pool);
        let df = DataFrame::new(vec![
            Series::new("ok".into(), &[1i64]).into_column(),
            Series::new("bad column".into(), &[2i64]).into_column(),
        ])
        .unwrap();

        let result = store.write_table(&df, "ds_cols", WriteMode::Replace).await;
        assert!(matches!(result, Err(StoreError::InvalidColumn(_))));
    }
}
