//! Format parsers
//!
//! Turn file bytes into an ordered sequence of [`ParsedRow`]s, one per data
//! row. A row that does not fit the configured shape is still emitted, as
//! [`ParsedRow::Malformed`], so row counts and ordering always match the
//! source file.

use super::catalog::{DelimitedConfig, FixedWidthConfig, FormatConfig};

/// Raw field values of one well-formed row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// One-based data row number (header and blank lines excluded)
    pub row: usize,
    /// One-based physical line in the source
    pub line: usize,
    /// Header or fixed-width field names; empty for positional files
    pub columns: Vec<String>,
    pub values: Vec<String>,
}

impl RawRecord {
    pub fn by_position(&self, index: usize) -> Option<&str> {
        self.values.get(index).map(String::as_str)
    }

    pub fn by_name(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c == name || c.eq_ignore_ascii_case(name))
            .and_then(|i| self.by_position(i))
    }

    /// Name of column `index`, falling back to its position
    pub fn column_name(&self, index: usize) -> String {
        self.columns
            .get(index)
            .cloned()
            .unwrap_or_else(|| index.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedRow {
    Record(RawRecord),
    Malformed {
        row: usize,
        line: usize,
        raw: String,
        error: String,
    },
}

impl ParsedRow {
    pub fn row(&self) -> usize {
        match self {
            ParsedRow::Record(record) => record.row,
            ParsedRow::Malformed { row, .. } => *row,
        }
    }
}

pub fn parse(bytes: &[u8], format: &FormatConfig) -> Vec<ParsedRow> {
    match format {
        FormatConfig::Delimited(config) => parse_delimited(bytes, config),
        FormatConfig::FixedWidth(config) => parse_fixed_width(bytes, config),
    }
}

pub fn parse_delimited(bytes: &[u8], config: &DelimitedConfig) -> Vec<ParsedRow> {
    let delimiter = config.delimiter.to_string();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(config.delimiter as u8)
        .has_headers(config.has_header)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    let columns: Vec<String> = if config.has_header {
        match reader.byte_headers() {
            Ok(headers) => headers
                .iter()
                .map(|h| String::from_utf8_lossy(h).trim().trim_start_matches('\u{feff}').to_string())
                .collect(),
            Err(e) => {
                rows.push(ParsedRow::Malformed {
                    row: 0,
                    line: 1,
                    raw: String::new(),
                    error: format!("unreadable header: {}", e),
                });
                return rows;
            },
        }
    } else {
        Vec::new()
    };
    let expected = config
        .columns
        .or_else(|| (!columns.is_empty()).then_some(columns.len()));

    let mut record = csv::ByteRecord::new();
    let mut row = 0;
    loop {
        let read = reader.read_byte_record(&mut record);
        row += 1;
        match read {
            Ok(false) => break,
            Ok(true) => {
                let line = record.position().map(|p| p.line() as usize).unwrap_or(row);
                let decoded: Result<Vec<String>, _> = record
                    .iter()
                    .map(|field| std::str::from_utf8(field).map(str::to_string))
                    .collect();
                let raw = || {
                    record
                        .iter()
                        .map(|f| String::from_utf8_lossy(f).into_owned())
                        .collect::<Vec<_>>()
                        .join(&delimiter)
                };

                let values = match decoded {
                    Ok(values) => values,
                    Err(e) => {
                        rows.push(ParsedRow::Malformed {
                            row,
                            line,
                            raw: raw(),
                            error: format!("invalid UTF-8: {}", e),
                        });
                        continue;
                    },
                };

                if let Some(expected) = expected {
                    if values.len() != expected {
                        rows.push(ParsedRow::Malformed {
                            row,
                            line,
                            raw: raw(),
                            error: format!("expected {} columns, found {}", expected, values.len()),
                        });
                        continue;
                    }
                }

                rows.push(ParsedRow::Record(RawRecord {
                    row,
                    line,
                    columns: columns.clone(),
                    values,
                }));
            },
            Err(e) => {
                let line = e.position().map(|p| p.line() as usize).unwrap_or(row);
                let fatal = matches!(e.kind(), csv::ErrorKind::Io(_));
                rows.push(ParsedRow::Malformed {
                    row,
                    line,
                    raw: String::new(),
                    error: e.to_string(),
                });
                if fatal {
                    break;
                }
            },
        }
    }
    rows
}

pub fn parse_fixed_width(bytes: &[u8], config: &FixedWidthConfig) -> Vec<ParsedRow> {
    let text = String::from_utf8_lossy(bytes);
    let columns: Vec<String> = config.fields.iter().map(|f| f.name.clone()).collect();
    let mut rows = Vec::new();
    let mut row = 0;

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        row += 1;

        let chars: Vec<char> = line.chars().collect();
        let mut values = Vec::with_capacity(config.fields.len());
        let mut error = None;
        for field in &config.fields {
            if field.start >= chars.len() {
                error = Some(format!(
                    "line has {} characters; field '{}' starts at offset {}",
                    chars.len(),
                    field.name,
                    field.start
                ));
                break;
            }
            let end = (field.start + field.length).min(chars.len());
            values.push(chars[field.start..end].iter().collect::<String>().trim().to_string());
        }

        rows.push(match error {
            Some(error) => ParsedRow::Malformed {
                row,
                line: line_no,
                raw: line.to_string(),
                error,
            },
            None => ParsedRow::Record(RawRecord {
                row,
                line: line_no,
                columns: columns.clone(),
                values,
            }),
        });
    }
    rows
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::import::catalog::FixedWidthField;

    fn property_format() -> DelimitedConfig {
        DelimitedConfig {
            delimiter: ',',
            has_header: false,
            columns: Some(7),
        }
    }

    fn record(row: &ParsedRow) -> &RawRecord {
        match row {
            ParsedRow::Record(r) => r,
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_delimited_rows_keep_order_and_numbering() {
        let input = b"BC001,123 Main St,12345,residential,active,0.25,150000\n\
                      BC002,\"45 Oak Ave, Unit 2\",12346,commercial,active,1.5,990000\n";
        let rows = parse_delimited(input, &property_format());

        assert_eq!(rows.len(), 2);
        let first = record(&rows[0]);
        assert_eq!(first.row, 1);
        assert_eq!(first.by_position(1), Some("123 Main St"));
        let second = record(&rows[1]);
        assert_eq!(second.row, 2);
        assert_eq!(second.line, 2);
        assert_eq!(second.by_position(1), Some("45 Oak Ave, Unit 2"));
    }

    #[test]
    fn test_wrong_column_count_is_malformed_not_dropped() {
        let input = b"BC001,a,1,r,active,0.1,10\nBC002,a,1,r,active,0.1,10\nBC003,broken\nBC004,a,1,r,active,0.1,10\n";
        let rows = parse_delimited(input, &property_format());

        assert_eq!(rows.len(), 4);
        match &rows[2] {
            ParsedRow::Malformed { row, raw, error, .. } => {
                assert_eq!(*row, 3);
                assert_eq!(raw, "BC003,broken");
                assert!(error.contains("expected 7 columns, found 2"));
            },
            other => panic!("expected malformed row, got {:?}", other),
        }
        assert_eq!(rows.iter().map(ParsedRow::row).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_header_row_names_columns() {
        let config = DelimitedConfig {
            delimiter: '|',
            has_header: true,
            columns: None,
        };
        let input = "\u{feff}improvement_id|parcel_number|year_built\nI-1|12345|1998\nI-2|12346\n";
        let rows = parse_delimited(input.as_bytes(), &config);

        assert_eq!(rows.len(), 2);
        let first = record(&rows[0]);
        assert_eq!(first.by_name("improvement_id"), Some("I-1"));
        assert_eq!(first.by_name("YEAR_BUILT"), Some("1998"));
        assert_eq!(first.line, 2);
        assert!(matches!(rows[1], ParsedRow::Malformed { row: 2, .. }));
    }

    #[test]
    fn test_invalid_utf8_row_is_malformed() {
        let input = b"BC001,a,1,r,active,0.1,10\nBC\xff2,a,1,r,active,0.1,10\n";
        let rows = parse_delimited(input, &property_format());
        assert!(matches!(&rows[1], ParsedRow::Malformed { error, .. } if error.contains("UTF-8")));
    }

    #[test]
    fn test_fixed_width_slices_and_trims() {
        let config = FixedWidthConfig {
            fields: vec![
                FixedWidthField {
                    name: "id".into(),
                    start: 0,
                    length: 6,
                    field_type: None,
                },
                FixedWidthField {
                    name: "acres".into(),
                    start: 6,
                    length: 8,
                    field_type: None,
                },
            ],
        };
        let input = "L001    2.50\r\n\nL002  \nL003  10.125\n";
        let rows = parse_fixed_width(input.as_bytes(), &config);

        assert_eq!(rows.len(), 3);
        assert_eq!(record(&rows[0]).values, vec!["L001", "2.50"]);
        assert!(matches!(&rows[1], ParsedRow::Malformed { row: 2, line: 3, .. }));
        let third = record(&rows[2]);
        assert_eq!(third.row, 3);
        assert_eq!(third.by_name("acres"), Some("10.125"));
    }
}
