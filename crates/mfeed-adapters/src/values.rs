//! Numeric cell text to `f64`, per page locale.

use serde::{Deserialize, Serialize};

/// Decimal convention of the page a cell came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumberLocale {
    /// `35,000.50`
    Dot,
    /// `35.000,50`
    Comma,
}

pub fn parse_number(text: &str, locale: NumberLocale) -> Option<f64> {
    let cleaned = text
        .trim()
        .chars()
        .filter_map(|c| match c {
            '%' | '+' => None,
            '\u{2212}' => Some('-'),
            c => Some(c),
        })
        .collect::<String>();
    let normalized = match locale {
        NumberLocale::Dot => cleaned.replace(',', ""),
        NumberLocale::Comma if cleaned.contains(',') => cleaned.replace('.', "").replace(',', "."),
        NumberLocale::Comma if cleaned.matches('.').count() > 1 => cleaned.replace('.', ""),
        NumberLocale::Comma => cleaned,
    };
    leading_float(normalized.trim())
}

/// Same rules as [`parse_number`]; the `%` sign is dropped and the value is
/// kept in percentage points.
pub fn parse_percent(text: &str, locale: NumberLocale) -> Option<f64> {
    parse_number(text, locale)
}

fn leading_float(s: &str) -> Option<f64> {
    let bytes = s.as_bytes();
    let digits_from = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        i
    };

    let mut end = digits_from(usize::from(bytes.first() == Some(&b'-')));

    if bytes.get(end) == Some(&b'.') {
        let frac_end = digits_from(end + 1);
        if frac_end > end + 1 {
            end = frac_end;
        }
    }
    if !s[..end].bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut i = end + 1;
        if matches!(bytes.get(i), Some(b'-' | b'+')) {
            i += 1;
        }
        let exp_end = digits_from(i);
        if exp_end > i {
            end = exp_end;
        }
    }

    s[..end].parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format_grouped(value: f64, locale: NumberLocale) -> String {
        let raw = format!("{:.2}", value.abs());
        let (int_part, frac_part) = raw.split_once('.').unwrap();
        let (group, decimal) = match locale {
            NumberLocale::Dot => (',', '.'),
            NumberLocale::Comma => ('.', ','),
        };
        let mut grouped = String::new();
        for (i, ch) in int_part.chars().enumerate() {
            if i > 0 && (int_part.len() - i) % 3 == 0 {
                grouped.push(group);
            }
            grouped.push(ch);
        }
        let sign = if value < 0.0 { "-" } else { "" };
        format!("{sign}{grouped}{decimal}{frac_part}")
    }

    #[test]
    fn dot_locale_strips_thousands_separators() {
        assert_eq!(parse_number("35,000.50", NumberLocale::Dot), Some(35000.5));
        assert_eq!(parse_number("  -1,234  ", NumberLocale::Dot), Some(-1234.0));
        assert_eq!(parse_number("+12.75", NumberLocale::Dot), Some(12.75));
    }

    #[test]
    fn comma_locale_swaps_decimal_separator() {
        assert_eq!(parse_number("5,4321", NumberLocale::Comma), Some(5.4321));
        assert_eq!(parse_number("128.456,78", NumberLocale::Comma), Some(128456.78));
        assert_eq!(parse_number("1.234.567", NumberLocale::Comma), Some(1234567.0));
        assert_eq!(parse_number("0.5", NumberLocale::Comma), Some(0.5));
    }

    #[test]
    fn percent_signs_and_unicode_minus_are_handled() {
        assert_eq!(parse_percent("+1.25%", NumberLocale::Dot), Some(1.25));
        assert_eq!(parse_percent("\u{2212}0,87%", NumberLocale::Comma), Some(-0.87));
        assert_eq!(parse_percent("-0.40%", NumberLocale::Dot), Some(-0.4));
    }

    #[test]
    fn trailing_garbage_keeps_the_numeric_prefix() {
        assert_eq!(parse_number("12.5K", NumberLocale::Dot), Some(12.5));
        assert_eq!(parse_number("3e2x", NumberLocale::Dot), Some(300.0));
        assert_eq!(parse_number("7e", NumberLocale::Dot), Some(7.0));
    }

    #[test]
    fn empty_and_non_numeric_text_is_none() {
        for text in ["", "   ", "-", "N/A", "abc", "%", "+", ".", "-."] {
            assert_eq!(parse_number(text, NumberLocale::Dot), None, "{text:?}");
            assert_eq!(parse_number(text, NumberLocale::Comma), None, "{text:?}");
        }
        assert_eq!(parse_number("NaN", NumberLocale::Dot), None);
        assert_eq!(parse_number("inf", NumberLocale::Dot), None);
    }

    #[test]
    fn formatted_values_parse_back() {
        for value in [0.0, 0.05, -3.5, 1234.56, -98765.43, 35000.5, 1_000_000.01] {
            for locale in [NumberLocale::Dot, NumberLocale::Comma] {
                let text = format_grouped(value, locale);
                let parsed = parse_number(&text, locale).unwrap();
                assert!((parsed - value).abs() < 1e-9, "{text} -> {parsed}");
            }
        }
    }
}
