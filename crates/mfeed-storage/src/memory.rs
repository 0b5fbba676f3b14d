use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, SecondsFormat, Utc};
use mfeed_core::RemoteSchema;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::{FeedStore, StoreError};

#[derive(Debug, Clone)]
struct StoredRow {
    id: u64,
    name: String,
    scraped_at: DateTime<Utc>,
    row: JsonMap<String, JsonValue>,
}

impl StoredRow {
    fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.row.clone())
    }
}

/// In-process store that mirrors the remote procedures' semantics.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<&'static str, Vec<StoredRow>>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.get(table).map(Vec::len).unwrap_or(0)
    }

    fn with_table<R>(&self, schema: &RemoteSchema, f: impl FnOnce(&mut Vec<StoredRow>) -> R) -> R {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        f(tables.entry(schema.table).or_default())
    }
}

fn decode_row(
    schema: &RemoteSchema,
    mut row: JsonMap<String, JsonValue>,
    id: u64,
    now: DateTime<Utc>,
) -> Result<StoredRow, StoreError> {
    let decode_err = |detail: String| StoreError::Decode {
        operation: format!("insert into {}", schema.table),
        detail,
    };
    let name = row
        .get("name")
        .and_then(JsonValue::as_str)
        .filter(|n| !n.trim().is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| decode_err("row is missing a name".into()))?;
    let scraped_at = row
        .get("scraped_at")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| decode_err(format!("row {name} is missing scraped_at")))
        .and_then(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| decode_err(format!("row {name} has invalid scraped_at: {e}")))
        })?;

    row.insert("id".into(), JsonValue::from(id));
    row.insert(
        "created_at".into(),
        JsonValue::String(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    Ok(StoredRow {
        id,
        name,
        scraped_at,
        row,
    })
}

fn newest_first(a: &StoredRow, b: &StoredRow) -> std::cmp::Ordering {
    b.scraped_at.cmp(&a.scraped_at).then(b.id.cmp(&a.id))
}

#[async_trait]
impl FeedStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn insert_rows(
        &self,
        schema: &RemoteSchema,
        rows: Vec<JsonMap<String, JsonValue>>,
    ) -> Result<usize, StoreError> {
        let now = Utc::now();
        // decode the whole batch before touching the table so a bad row rejects all of it
        let decoded = rows
            .into_iter()
            .map(|row| decode_row(schema, row, self.next_id.fetch_add(1, Ordering::Relaxed) + 1, now))
            .collect::<Result<Vec<_>, _>>()?;
        let count = decoded.len();
        self.with_table(schema, |table| table.extend(decoded));
        Ok(count)
    }

    async fn latest(&self, schema: &RemoteSchema) -> Result<Vec<JsonValue>, StoreError> {
        Ok(self.with_table(schema, |table| {
            let mut newest: BTreeMap<&str, &StoredRow> = BTreeMap::new();
            for row in table.iter() {
                newest
                    .entry(row.name.as_str())
                    .and_modify(|cur| {
                        if newest_first(row, *cur).is_lt() {
                            *cur = row;
                        }
                    })
                    .or_insert(row);
            }
            newest.values().map(|r| r.to_json()).collect()
        }))
    }

    async fn history(
        &self,
        schema: &RemoteSchema,
        name: &str,
        limit: u32,
    ) -> Result<Vec<JsonValue>, StoreError> {
        Ok(self.with_table(schema, |table| {
            let mut rows = table.iter().filter(|r| r.name == name).collect::<Vec<_>>();
            rows.sort_by(|a, b| newest_first(a, b));
            rows.into_iter().take(limit as usize).map(StoredRow::to_json).collect()
        }))
    }

    async fn by_date_range(
        &self,
        schema: &RemoteSchema,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<JsonValue>, StoreError> {
        Ok(self.with_table(schema, |table| {
            let mut rows = table
                .iter()
                .filter(|r| {
                    let day = r.scraped_at.date_naive();
                    day >= start && day <= end
                })
                .collect::<Vec<_>>();
            rows.sort_by(|a, b| newest_first(a, b));
            rows.into_iter().map(StoredRow::to_json).collect()
        }))
    }

    async fn cleanup_older_than(
        &self,
        schema: &RemoteSchema,
        days_to_keep: u32,
    ) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days_to_keep));
        Ok(self.with_table(schema, |table| {
            let before = table.len();
            table.retain(|r| r.scraped_at >= cutoff);
            (before - table.len()) as u64
        }))
    }
}
