//! Feed page descriptions and the HTML table extractor shared by every feed.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mfeed_core::FeedKind;
use mfeed_core::FeedRecord;
use mfeed_storage::BrowserProfile;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub mod values;

pub use values::{parse_number, parse_percent, NumberLocale};

pub const CRATE_NAME: &str = "mfeed-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Number,
    Percent,
    Text,
}

/// Where to find one value in a row: by `data-test` attribute first, then by
/// 1-based column position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub column: &'static str,
    pub data_test: Option<&'static str>,
    pub position: usize,
    pub kind: CellKind,
}

impl ColumnSpec {
    const fn new(column: &'static str, data_test: Option<&'static str>, position: usize, kind: CellKind) -> Self {
        Self {
            column,
            data_test,
            position,
            kind,
        }
    }
}

/// Everything that differs between feeds: page, headers, locale and layout.
#[derive(Debug, Clone)]
pub struct FeedSpec {
    pub feed: FeedKind,
    pub url: String,
    pub profile: BrowserProfile,
    pub locale: NumberLocale,
    pub table_selectors: Vec<&'static str>,
    pub name_selectors: Vec<&'static str>,
    pub columns: Vec<ColumnSpec>,
    pub time_column: Option<ColumnSpec>,
}

impl FeedSpec {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

const INDEX_NAME_SELECTORS: &[&str] = &[
    r#"td[data-test="name"]"#,
    "td.name",
    "td:first-child a",
    "td:nth-child(2) a",
    "td:nth-child(1) a",
];

fn index_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::new("last", Some("last"), 3, CellKind::Number),
        ColumnSpec::new("high", Some("high"), 4, CellKind::Number),
        ColumnSpec::new("low", Some("low"), 5, CellKind::Number),
        ColumnSpec::new("change", Some("change"), 6, CellKind::Number),
        ColumnSpec::new("change_percent", Some("change-percent"), 7, CellKind::Percent),
    ]
}

pub fn feed_spec(feed: FeedKind) -> FeedSpec {
    match feed {
        FeedKind::UsIndices => FeedSpec {
            feed,
            url: "https://www.investing.com/indices/usa-indices?include-major-indices=true".into(),
            profile: BrowserProfile::english(),
            locale: NumberLocale::Dot,
            table_selectors: vec![".dynamic-table", "table"],
            name_selectors: INDEX_NAME_SELECTORS.to_vec(),
            columns: index_columns(),
            time_column: Some(ColumnSpec::new("time", Some("time"), 8, CellKind::Text)),
        },
        FeedKind::BrazilIndices => FeedSpec {
            feed,
            url: "https://br.investing.com/indices/brazil-indices".into(),
            profile: BrowserProfile::brazilian_portuguese(),
            locale: NumberLocale::Comma,
            table_selectors: vec![".dynamic-table", "table"],
            name_selectors: INDEX_NAME_SELECTORS.to_vec(),
            columns: index_columns(),
            time_column: Some(ColumnSpec::new("time", Some("time"), 8, CellKind::Text)),
        },
        FeedKind::Currencies => FeedSpec {
            feed,
            url: "https://br.investing.com/technical/technical-summary".into(),
            profile: BrowserProfile::brazilian_portuguese(),
            locale: NumberLocale::Comma,
            table_selectors: vec!["#QBS_1_inner", "table"],
            name_selectors: vec!["td:nth-child(2) a"],
            columns: vec![
                ColumnSpec::new("last_price", None, 3, CellKind::Number),
                ColumnSpec::new("change", None, 4, CellKind::Number),
                ColumnSpec::new("change_percent", None, 5, CellKind::Percent),
            ],
            time_column: None,
        },
        FeedKind::Commodities => FeedSpec {
            feed,
            url: "https://www.investing.com/commodities".into(),
            profile: BrowserProfile::english(),
            locale: NumberLocale::Dot,
            table_selectors: vec![r#"div[data-test="dynamic-table"]"#, ".dynamic-table", "table"],
            name_selectors: INDEX_NAME_SELECTORS.to_vec(),
            columns: vec![
                ColumnSpec::new("fifteen_minutes", Some("15-minutes"), 3, CellKind::Percent),
                ColumnSpec::new("hourly", Some("hourly"), 4, CellKind::Percent),
                ColumnSpec::new("daily", Some("daily"), 5, CellKind::Percent),
                ColumnSpec::new("one_week", Some("1-week"), 6, CellKind::Percent),
                ColumnSpec::new("one_month", Some("1-month"), 7, CellKind::Percent),
                ColumnSpec::new("ytd", Some("ytd"), 8, CellKind::Percent),
                ColumnSpec::new("three_years", Some("3-years"), 9, CellKind::Percent),
            ],
            time_column: None,
        },
    }
}

pub fn all_feed_specs() -> Vec<FeedSpec> {
    FeedKind::ALL.into_iter().map(feed_spec).collect()
}

pub fn feed_spec_for_slug(slug: &str) -> Option<FeedSpec> {
    FeedKind::from_slug(slug).map(feed_spec)
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no {feed} table matched any of {selectors:?}")]
    TableNotFound {
        feed: FeedKind,
        selectors: Vec<String>,
    },
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
}

/// Records pulled from one page plus the row accounting for the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Extraction {
    pub records: Vec<FeedRecord>,
    pub rows_seen: usize,
    pub rows_skipped: usize,
    pub rows_dropped: usize,
}

struct CompiledColumn<'a> {
    spec: &'a ColumnSpec,
    by_data_test: Option<Selector>,
    by_position: Selector,
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn compile_column(spec: &ColumnSpec) -> Result<CompiledColumn<'_>, ExtractError> {
    Ok(CompiledColumn {
        spec,
        by_data_test: spec
            .data_test
            .map(|dt| parse_selector(&format!(r#"td[data-test="{dt}"]"#)))
            .transpose()?,
        by_position: parse_selector(&format!("td:nth-child({})", spec.position))?,
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>()
}

fn locate_table<'a>(document: &'a Html, spec: &FeedSpec) -> Result<ElementRef<'a>, ExtractError> {
    let inner_table = parse_selector("table")?;
    for raw in &spec.table_selectors {
        let selector = parse_selector(raw)?;
        if let Some(found) = document.select(&selector).next() {
            if found.value().name() == "table" {
                return Ok(found);
            }
            return Ok(found.select(&inner_table).next().unwrap_or(found));
        }
    }
    Err(ExtractError::TableNotFound {
        feed: spec.feed,
        selectors: spec.table_selectors.iter().map(ToString::to_string).collect(),
    })
}

fn cell_text(row: ElementRef<'_>, column: &CompiledColumn<'_>) -> Option<String> {
    column
        .by_data_test
        .as_ref()
        .and_then(|sel| row.select(sel).next())
        .or_else(|| row.select(&column.by_position).next())
        .and_then(|cell| text_or_none(element_text(cell)))
}

fn is_placeholder_row(cells: &[ElementRef<'_>]) -> bool {
    match cells {
        [] => true,
        [only] => only.value().attr("colspan").is_some(),
        _ => false,
    }
}

pub fn extract_rows(html: &str, spec: &FeedSpec) -> Result<Extraction, ExtractError> {
    extract_rows_at(html, spec, Utc::now())
}

/// Same as [`extract_rows`] with an explicit scrape timestamp.
pub fn extract_rows_at(
    html: &str,
    spec: &FeedSpec,
    scraped_at: DateTime<Utc>,
) -> Result<Extraction, ExtractError> {
    let document = Html::parse_document(html);
    let table = locate_table(&document, spec)?;

    let row_sel = parse_selector("tbody tr")?;
    let cell_sel = parse_selector("td")?;
    let name_sels = spec
        .name_selectors
        .iter()
        .map(|s| parse_selector(s))
        .collect::<Result<Vec<_>, _>>()?;
    let columns = spec
        .columns
        .iter()
        .map(compile_column)
        .collect::<Result<Vec<_>, _>>()?;
    let time_column = spec.time_column.as_ref().map(compile_column).transpose()?;

    let mut out = Extraction::default();
    for (index, row) in table.select(&row_sel).enumerate() {
        out.rows_seen += 1;
        let cells = row.select(&cell_sel).collect::<Vec<_>>();
        if is_placeholder_row(&cells) {
            warn!(feed = %spec.feed, row = index, cells = cells.len(), "skipping row without data cells");
            out.rows_skipped += 1;
            continue;
        }

        let name = name_sels
            .iter()
            .find_map(|sel| row.select(sel).find_map(|el| text_or_none(element_text(el))))
            .unwrap_or_default();

        let mut record = FeedRecord::new(spec.feed, name, scraped_at);
        for column in &columns {
            let text = cell_text(row, column);
            let value = text.as_deref().and_then(|t| match column.spec.kind {
                CellKind::Number => parse_number(t, spec.locale),
                CellKind::Percent => parse_percent(t, spec.locale),
                CellKind::Text => None,
            });
            record = record.with_metric(column.spec.column, value);
        }
        if let Some(column) = &time_column {
            record = record.with_time(cell_text(row, column));
        }

        if record.is_publishable() {
            out.records.push(record);
        } else {
            debug!(feed = %spec.feed, row = index, name = %record.name, "dropping row without name or values");
            out.rows_dropped += 1;
        }
    }
    Ok(out)
}

/// Path of a captured sample page: `fixtures/<feed>/sample/page.html`.
pub fn fixture_page_path(workspace_root: impl AsRef<Path>, feed: FeedKind) -> PathBuf {
    workspace_root
        .as_ref()
        .join("fixtures")
        .join(feed.slug())
        .join("sample")
        .join("page.html")
}

pub fn load_fixture_page(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path).with_context(|| format!("reading fixture page {}", path.display()))
}
