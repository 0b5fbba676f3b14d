use async_trait::async_trait;
use chrono::NaiveDate;
use mfeed_core::RemoteSchema;
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;

use crate::{FeedStore, StoreError};

/// Direct Postgres connection running the same stored procedures the REST
/// backend calls. Writes go through a separate pool when one is configured.
#[derive(Debug, Clone)]
pub struct PgStore {
    reader: PgPool,
    writer: Option<PgPool>,
}

impl PgStore {
    pub fn new(reader: PgPool, writer: Option<PgPool>) -> Self {
        Self { reader, writer }
    }

    /// Pools connect on first use, so a missing database surfaces per call.
    pub fn connect_lazy(read_url: &str, write_url: Option<&str>) -> Result<Self, StoreError> {
        let reader = PgPoolOptions::new().max_connections(5).connect_lazy(read_url)?;
        let writer = write_url
            .map(|url| PgPoolOptions::new().max_connections(5).connect_lazy(url))
            .transpose()?;
        Ok(Self { reader, writer })
    }

    pub fn reader(&self) -> &PgPool {
        &self.reader
    }

    fn writer(&self) -> Result<&PgPool, StoreError> {
        self.writer
            .as_ref()
            .ok_or(StoreError::MissingPrivilegedCredential)
    }
}

fn json_rows(rows: Vec<PgRow>) -> Result<Vec<JsonValue>, StoreError> {
    rows.into_iter()
        .map(|row| -> Result<JsonValue, StoreError> {
            let Json(value): Json<JsonValue> = row.try_get("row")?;
            Ok(value)
        })
        .collect()
}

fn quoted(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[async_trait]
impl FeedStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn insert_rows(
        &self,
        schema: &RemoteSchema,
        rows: Vec<JsonMap<String, JsonValue>>,
    ) -> Result<usize, StoreError> {
        let pool = self.writer()?;
        let columns = schema
            .insert_columns()
            .into_iter()
            .map(quoted)
            .collect::<Vec<_>>()
            .join(", ");
        let table = quoted(schema.table);
        let sql = format!(
            "INSERT INTO {table} ({columns}) \
             SELECT {columns} FROM jsonb_populate_recordset(NULL::{table}, $1)"
        );
        let payload = JsonValue::Array(rows.into_iter().map(JsonValue::Object).collect());
        let result = sqlx::query(&sql).bind(Json(payload)).execute(pool).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn latest(&self, schema: &RemoteSchema) -> Result<Vec<JsonValue>, StoreError> {
        let sql = format!("SELECT to_jsonb(r) AS row FROM {}() AS r", quoted(schema.latest_fn));
        json_rows(sqlx::query(&sql).fetch_all(&self.reader).await?)
    }

    async fn history(
        &self,
        schema: &RemoteSchema,
        name: &str,
        limit: u32,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let sql = format!(
            "SELECT to_jsonb(r) AS row FROM {}($1, $2) AS r",
            quoted(schema.history_fn)
        );
        let limit = i32::try_from(limit).unwrap_or(i32::MAX);
        let rows = sqlx::query(&sql)
            .bind(name)
            .bind(limit)
            .fetch_all(&self.reader)
            .await?;
        json_rows(rows)
    }

    async fn by_date_range(
        &self,
        schema: &RemoteSchema,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let sql = format!(
            "SELECT to_jsonb(r) AS row FROM {}($1, $2) AS r",
            quoted(schema.range_fn)
        );
        let rows = sqlx::query(&sql)
            .bind(start)
            .bind(end)
            .fetch_all(&self.reader)
            .await?;
        json_rows(rows)
    }

    async fn cleanup_older_than(
        &self,
        schema: &RemoteSchema,
        days_to_keep: u32,
    ) -> Result<u64, StoreError> {
        let pool = self.writer()?;
        let sql = format!("SELECT {}($1) AS deleted", quoted(schema.cleanup_fn));
        let days = i32::try_from(days_to_keep).unwrap_or(i32::MAX);
        let row = sqlx::query(&sql).bind(days).fetch_one(pool).await?;
        let deleted: Option<i32> = row.try_get("deleted")?;
        Ok(deleted.map(|d| d.max(0) as u64).unwrap_or(0))
    }
}
