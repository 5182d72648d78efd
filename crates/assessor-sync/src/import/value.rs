//! Typed field values and coercion from raw text

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Date layouts seen in county exports, tried in order
pub const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y%m%d"];

/// Semantic type of a mapped field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    String,
    Integer,
    Decimal,
    /// Integer when integral, decimal otherwise
    Number,
    Date,
    Boolean,
}

/// String transform applied before coercion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Trim,
    Uppercase,
    Lowercase,
    DigitsOnly,
}

impl Transform {
    pub fn apply(self, value: &str) -> String {
        match self {
            Transform::Trim => value.trim().to_string(),
            Transform::Uppercase => value.to_uppercase(),
            Transform::Lowercase => value.to_lowercase(),
            Transform::DigitsOnly => value.chars().filter(char::is_ascii_digit).collect(),
        }
    }
}

/// A mapped, typed field value
///
/// Serialized with an explicit type tag; decimals travel as their exact
/// decimal text so `"0.1"` or `"12345678901234.56"` come back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Decimal(BigDecimal),
    Date(NaiveDate),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Canonical text used when the value identifies a record
    pub fn as_key(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(s) if s.trim().is_empty() => None,
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Boolean(b) => write!(f, "{}", b),
            FieldValue::Integer(i) => write!(f, "{}", i),
            FieldValue::Decimal(d) => write!(f, "{}", d),
            FieldValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            FieldValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl FieldType {
    /// Coerce non-empty raw text into this type
    pub fn coerce(self, raw: &str) -> Result<FieldValue, String> {
        match self {
            FieldType::String => Ok(FieldValue::Text(raw.to_string())),
            FieldType::Integer => parse_integer(raw)
                .map(FieldValue::Integer)
                .ok_or_else(|| format!("expected integer, got '{}'", raw)),
            FieldType::Decimal => parse_decimal(raw)
                .map(FieldValue::Decimal)
                .ok_or_else(|| format!("expected decimal, got '{}'", raw)),
            FieldType::Number => {
                if let Some(i) = parse_integer(raw) {
                    Ok(FieldValue::Integer(i))
                } else {
                    parse_decimal(raw)
                        .map(FieldValue::Decimal)
                        .ok_or_else(|| format!("expected number, got '{}'", raw))
                }
            },
            FieldType::Date => parse_date(raw)
                .map(FieldValue::Date)
                .ok_or_else(|| format!("expected date (YYYY-MM-DD, MM/DD/YYYY or YYYYMMDD), got '{}'", raw)),
            FieldType::Boolean => parse_boolean(raw)
                .map(FieldValue::Boolean)
                .ok_or_else(|| format!("expected boolean, got '{}'", raw)),
        }
    }
}

/// Strip currency symbols and thousands separators
fn numeric_text(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect()
}

fn parse_integer(raw: &str) -> Option<i64> {
    let text = numeric_text(raw);
    if let Ok(i) = text.parse::<i64>() {
        return Some(i);
    }
    // "150000.00" is still an integer amount.
    let (whole, fraction) = text.split_once('.')?;
    if !fraction.is_empty() && fraction.chars().all(|c| c == '0') {
        return whole.parse().ok();
    }
    None
}

fn parse_decimal(raw: &str) -> Option<BigDecimal> {
    let text = numeric_text(raw);
    // BigDecimal also reads exponents; county exports never use them
    if text.is_empty() || text.contains(['e', 'E']) {
        return None;
    }
    BigDecimal::from_str(&text).ok()
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
}

fn parse_boolean(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "y" | "yes" | "true" | "t" | "1" => Some(true),
        "n" | "no" | "false" | "f" | "0" => Some(false),
        _ => None,
    }
}
