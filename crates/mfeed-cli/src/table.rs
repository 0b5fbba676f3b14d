//! Plain-text rendering of scraped records for the terminal.

use mfeed_adapters::{CellKind, FeedSpec};
use mfeed_core::FeedRecord;

fn format_value(value: Option<f64>, kind: CellKind) -> String {
    match (value, kind) {
        (None, _) => "N/A".to_string(),
        (Some(v), CellKind::Percent) => format!("{v:+.2}%"),
        (Some(v), _) => format!("{v:.2}"),
    }
}

/// One header row, a rule, then one line per record. Numbers are right
/// aligned; missing values print as `N/A`.
pub fn render_records(spec: &FeedSpec, records: &[FeedRecord]) -> String {
    let mut header = vec!["Name".to_string()];
    header.extend(spec.columns.iter().map(|c| c.column.to_string()));
    if spec.time_column.is_some() {
        header.push("time".to_string());
    }

    let rows = records
        .iter()
        .map(|record| {
            let mut cells = vec![record.name.clone()];
            cells.extend(
                spec.columns
                    .iter()
                    .map(|c| format_value(record.metric(c.column), c.kind)),
            );
            if spec.time_column.is_some() {
                cells.push(record.time.clone().unwrap_or_else(|| "N/A".to_string()));
            }
            cells
        })
        .collect::<Vec<_>>();

    let widths = (0..header.len())
        .map(|i| {
            rows.iter()
                .map(|r| r[i].chars().count())
                .chain(std::iter::once(header[i].chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect::<Vec<_>>();

    let line = |cells: &[String]| {
        cells
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                if i == 0 {
                    format!("{cell:<w$}", w = widths[i])
                } else {
                    format!("{cell:>w$}", w = widths[i])
                }
            })
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = String::new();
    out.push_str(&line(&header));
    out.push('\n');
    out.push_str(&"-".repeat(widths.iter().sum::<usize>() + 2 * widths.len().saturating_sub(1)));
    out.push('\n');
    for row in &rows {
        out.push_str(&line(row));
        out.push('\n');
    }
    out.push_str(&format!("{} {} record(s)\n", records.len(), spec.feed.display_name()));
    out
}
