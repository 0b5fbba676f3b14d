//! Core domain model for the market feed scraper: feeds, scraped records and
//! the remote schema each feed persists into.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "mfeed-core";

/// One market-data category scraped on its own schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedKind {
    UsIndices,
    BrazilIndices,
    Currencies,
    Commodities,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown feed `{0}` (expected one of us-indices, brazil-indices, currencies, commodities)")]
pub struct UnknownFeed(pub String);

impl FeedKind {
    pub const ALL: [FeedKind; 4] = [
        FeedKind::UsIndices,
        FeedKind::BrazilIndices,
        FeedKind::Currencies,
        FeedKind::Commodities,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            FeedKind::UsIndices => "us-indices",
            FeedKind::BrazilIndices => "brazil-indices",
            FeedKind::Currencies => "currencies",
            FeedKind::Commodities => "commodities",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            FeedKind::UsIndices => "US Indices",
            FeedKind::BrazilIndices => "Brazil Indices",
            FeedKind::Currencies => "Currencies",
            FeedKind::Commodities => "Commodities",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.slug() == slug)
    }

    pub fn remote_schema(self) -> &'static RemoteSchema {
        match self {
            FeedKind::UsIndices => &US_INDICES_SCHEMA,
            FeedKind::BrazilIndices => &BRAZIL_INDICES_SCHEMA,
            FeedKind::Currencies => &CURRENCIES_SCHEMA,
            FeedKind::Commodities => &COMMODITIES_SCHEMA,
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for FeedKind {
    type Err = UnknownFeed;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_slug(s.trim()).ok_or_else(|| UnknownFeed(s.to_string()))
    }
}

/// Table and stored-procedure names a feed is persisted through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSchema {
    pub table: &'static str,
    pub metric_columns: &'static [&'static str],
    pub has_time: bool,
    pub latest_fn: &'static str,
    pub history_fn: &'static str,
    pub range_fn: &'static str,
    pub cleanup_fn: &'static str,
}

impl RemoteSchema {
    /// Columns written by a batch insert, in insert order.
    pub fn insert_columns(&self) -> Vec<&'static str> {
        let mut cols = Vec::with_capacity(self.metric_columns.len() + 3);
        cols.push("name");
        cols.extend_from_slice(self.metric_columns);
        if self.has_time {
            cols.push("time");
        }
        cols.push("scraped_at");
        cols
    }
}

pub const INDEX_METRIC_COLUMNS: &[&str] = &["last", "high", "low", "change", "change_percent"];
pub const CURRENCY_METRIC_COLUMNS: &[&str] = &["last_price", "change", "change_percent"];
pub const COMMODITY_METRIC_COLUMNS: &[&str] = &[
    "fifteen_minutes",
    "hourly",
    "daily",
    "one_week",
    "one_month",
    "ytd",
    "three_years",
];

pub static US_INDICES_SCHEMA: RemoteSchema = RemoteSchema {
    table: "us_indices",
    metric_columns: INDEX_METRIC_COLUMNS,
    has_time: true,
    latest_fn: "get_latest_us_indices",
    history_fn: "get_us_index_history",
    range_fn: "get_us_indices_by_date_range",
    cleanup_fn: "cleanup_old_us_indices_data",
};

pub static BRAZIL_INDICES_SCHEMA: RemoteSchema = RemoteSchema {
    table: "brazil_indices",
    metric_columns: INDEX_METRIC_COLUMNS,
    has_time: true,
    latest_fn: "get_latest_brazil_indices",
    history_fn: "get_brazil_index_history",
    range_fn: "get_brazil_indices_by_date_range",
    cleanup_fn: "cleanup_old_brazil_indices_data",
};

pub static CURRENCIES_SCHEMA: RemoteSchema = RemoteSchema {
    table: "currencies",
    metric_columns: CURRENCY_METRIC_COLUMNS,
    has_time: false,
    latest_fn: "get_latest_currencies",
    history_fn: "get_currency_history",
    range_fn: "get_currencies_by_date_range",
    cleanup_fn: "cleanup_old_currencies_data",
};

pub static COMMODITIES_SCHEMA: RemoteSchema = RemoteSchema {
    table: "commodities",
    metric_columns: COMMODITY_METRIC_COLUMNS,
    has_time: false,
    latest_fn: "get_latest_commodities",
    history_fn: "get_commodity_history",
    range_fn: "get_commodities_by_date_range",
    cleanup_fn: "cleanup_old_commodities_data",
};

/// One scraped observation of an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub feed: FeedKind,
    pub name: String,
    #[serde(flatten)]
    pub metrics: BTreeMap<String, Option<f64>>,
    #[serde(default)]
    pub time: Option<String>,
    pub scraped_at: DateTime<Utc>,
}

impl FeedRecord {
    pub fn new(feed: FeedKind, name: impl Into<String>, scraped_at: DateTime<Utc>) -> Self {
        Self {
            feed,
            name: name.into(),
            metrics: BTreeMap::new(),
            time: None,
            scraped_at,
        }
    }

    pub fn with_metric(mut self, column: &str, value: Option<f64>) -> Self {
        self.metrics.insert(column.to_string(), value);
        self
    }

    pub fn with_time(mut self, time: Option<String>) -> Self {
        self.time = time;
        self
    }

    pub fn metric(&self, column: &str) -> Option<f64> {
        self.metrics.get(column).copied().flatten()
    }

    pub fn has_any_metric(&self) -> bool {
        self.metrics.values().any(Option::is_some)
    }

    /// A record is worth persisting only with a name and at least one value.
    pub fn is_publishable(&self) -> bool {
        !self.name.trim().is_empty() && self.has_any_metric()
    }

    /// Row object keyed by the remote column names of this record's feed.
    pub fn to_row(&self) -> JsonMap<String, JsonValue> {
        let schema = self.feed.remote_schema();
        let mut row = JsonMap::new();
        row.insert("name".into(), JsonValue::String(self.name.clone()));
        for column in schema.metric_columns {
            let value = self
                .metric(column)
                .and_then(serde_json::Number::from_f64)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null);
            row.insert((*column).to_string(), value);
        }
        if schema.has_time {
            row.insert(
                "time".into(),
                self.time
                    .clone()
                    .map(JsonValue::String)
                    .unwrap_or(JsonValue::Null),
            );
        }
        row.insert(
            "scraped_at".into(),
            JsonValue::String(self.scraped_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        row
    }
}

/// Outcome recorded for a finished job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::PartialSuccess => "partial_success",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
