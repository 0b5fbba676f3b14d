use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use mfeed_core::RemoteSchema;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tracing::debug;

use crate::{FeedStore, StoreError};

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub base_url: String,
    /// Privileged key; inserts and cleanup require it.
    pub service_key: Option<String>,
    /// Public key used for reads.
    pub anon_key: Option<String>,
    pub timeout: Duration,
}

/// Hosted Postgres reached through its PostgREST endpoint (`/rest/v1`).
#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    service_key: Option<String>,
    anon_key: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum KeyRole {
    Privileged,
    Public,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_key: config.service_key.filter(|k| !k.trim().is_empty()),
            anon_key: config.anon_key.filter(|k| !k.trim().is_empty()),
        })
    }

    pub fn writes_enabled(&self) -> bool {
        self.service_key.is_some()
    }

    fn key(&self, role: KeyRole) -> Result<&str, StoreError> {
        match role {
            KeyRole::Privileged => self
                .service_key
                .as_deref()
                .ok_or(StoreError::MissingPrivilegedCredential),
            KeyRole::Public => self
                .anon_key
                .as_deref()
                .ok_or(StoreError::MissingPublicCredential),
        }
    }

    async fn post(
        &self,
        role: KeyRole,
        path: &str,
        body: &JsonValue,
        operation: &str,
    ) -> Result<JsonValue, StoreError> {
        let key = self.key(role)?;
        let url = format!("{}/rest/v1/{}", self.base_url, path);
        debug!(%url, operation, "calling store");

        let resp = self
            .client
            .post(&url)
            .header("apikey", key)
            .bearer_auth(key)
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<JsonValue>(&text)
                .ok()
                .and_then(|v| v.get("message").and_then(JsonValue::as_str).map(ToString::to_string))
                .unwrap_or(text);
            return Err(StoreError::Remote {
                operation: operation.to_string(),
                status: status.as_u16(),
                message,
            });
        }
        if text.trim().is_empty() {
            return Ok(JsonValue::Null);
        }
        serde_json::from_str(&text).map_err(|e| StoreError::Decode {
            operation: operation.to_string(),
            detail: e.to_string(),
        })
    }

    async fn rpc_rows(
        &self,
        procedure: &str,
        args: JsonValue,
    ) -> Result<Vec<JsonValue>, StoreError> {
        match self
            .post(KeyRole::Public, &format!("rpc/{procedure}"), &args, procedure)
            .await?
        {
            JsonValue::Array(rows) => Ok(rows),
            JsonValue::Null => Ok(Vec::new()),
            other => Err(StoreError::Decode {
                operation: procedure.to_string(),
                detail: format!("expected a row array, got {other}"),
            }),
        }
    }
}

#[async_trait]
impl FeedStore for RestStore {
    fn backend(&self) -> &'static str {
        "rest"
    }

    async fn insert_rows(
        &self,
        schema: &RemoteSchema,
        rows: Vec<JsonMap<String, JsonValue>>,
    ) -> Result<usize, StoreError> {
        let body = JsonValue::Array(rows.into_iter().map(JsonValue::Object).collect());
        let operation = format!("insert into {}", schema.table);
        match self.post(KeyRole::Privileged, schema.table, &body, &operation).await? {
            JsonValue::Array(inserted) => Ok(inserted.len()),
            other => Err(StoreError::Decode {
                operation,
                detail: format!("expected inserted rows, got {other}"),
            }),
        }
    }

    async fn latest(&self, schema: &RemoteSchema) -> Result<Vec<JsonValue>, StoreError> {
        self.rpc_rows(schema.latest_fn, json!({})).await
    }

    async fn history(
        &self,
        schema: &RemoteSchema,
        name: &str,
        limit: u32,
    ) -> Result<Vec<JsonValue>, StoreError> {
        self.rpc_rows(schema.history_fn, json!({ "p_name": name, "p_limit": limit }))
            .await
    }

    async fn by_date_range(
        &self,
        schema: &RemoteSchema,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let args = json!({
            "p_start_date": start.format("%Y-%m-%d").to_string(),
            "p_end_date": end.format("%Y-%m-%d").to_string(),
        });
        self.rpc_rows(schema.range_fn, args).await
    }

    async fn cleanup_older_than(
        &self,
        schema: &RemoteSchema,
        days_to_keep: u32,
    ) -> Result<u64, StoreError> {
        let path = format!("rpc/{}", schema.cleanup_fn);
        let value = self
            .post(
                KeyRole::Privileged,
                &path,
                &json!({ "p_days_to_keep": days_to_keep }),
                schema.cleanup_fn,
            )
            .await?;
        match value {
            JsonValue::Null => Ok(0),
            JsonValue::Number(n) => n.as_u64().ok_or_else(|| StoreError::Decode {
                operation: schema.cleanup_fn.to_string(),
                detail: format!("deleted count {n} is not a non-negative integer"),
            }),
            other => Err(StoreError::Decode {
                operation: schema.cleanup_fn.to_string(),
                detail: format!("expected a deleted count, got {other}"),
            }),
        }
    }
}
