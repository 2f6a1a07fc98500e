// 🧾 Record Decoder
// Delimited bytes -> ordered RawRows. Structural problems abort the whole file.

use csv::{ErrorKind, ReaderBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// LAYOUT
// ============================================================================

/// Declared layout of an incoming file: delimiter plus the two columns
/// the pipeline cares about. Header text is configuration, not code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLayout {
    pub delimiter: u8,
    pub identity_column: String,
    pub amount_column: String,
}

impl Default for RecordLayout {
    fn default() -> Self {
        RecordLayout {
            delimiter: b',',
            identity_column: "id".to_string(),
            amount_column: "amount".to_string(),
        }
    }
}

impl RecordLayout {
    pub fn new(delimiter: u8, identity_column: &str, amount_column: &str) -> Self {
        RecordLayout {
            delimiter,
            identity_column: identity_column.to_string(),
            amount_column: amount_column.to_string(),
        }
    }
}

// ============================================================================
// CORE TYPES
// ============================================================================

/// One data row, column name -> value, in header order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    /// Physical line the row starts on (header is line 1)
    pub line: u64,
    fields: Vec<(String, String)>,
}

impl RawRow {
    pub fn new(line: u64, fields: Vec<(String, String)>) -> Self {
        RawRow { line, fields }
    }

    /// Value of a column, `None` when the header has no such column
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Fully decoded file. Only ever produced for structurally valid input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedFile {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl DecodedFile {
    pub fn has_column(&self, column: &str) -> bool {
        self.headers.iter().any(|h| h == column)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid UTF-8 near line {line}")]
    InvalidUtf8 { line: u64 },

    #[error("unterminated quoted field opened on line {line}")]
    UnterminatedQuote { line: u64 },

    #[error("line {line} has {found} columns but the header has {expected}")]
    ColumnCount {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("malformed delimited input: {0}")]
    Malformed(#[source] csv::Error),
}

// ============================================================================
// DECODING
// ============================================================================

/// Decode raw object content into rows.
///
/// The first line is the header. Blank lines are skipped. An empty object
/// (or a header with no data rows) yields zero rows rather than an error.
pub fn decode(content: &[u8], layout: &RecordLayout) -> Result<DecodedFile, DecodeError> {
    if let Some(line) = find_unterminated_quote(content, layout.delimiter) {
        return Err(DecodeError::UnterminatedQuote { line });
    }

    let mut reader = ReaderBuilder::new()
        .delimiter(layout.delimiter)
        .has_headers(true)
        .flexible(false)
        .from_reader(content);

    let headers: Vec<String> = reader
        .headers()
        .map_err(classify)?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows = Vec::new();

    for result in reader.records() {
        let record = result.map_err(classify)?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        let fields = headers
            .iter()
            .cloned()
            .zip(record.iter().map(|v| v.to_string()))
            .collect();

        rows.push(RawRow::new(line, fields));
    }

    Ok(DecodedFile { headers, rows })
}

fn classify(err: csv::Error) -> DecodeError {
    let line = err.position().map(|p| p.line()).unwrap_or(0);

    let mapped = match err.kind() {
        ErrorKind::Utf8 { .. } => Some(DecodeError::InvalidUtf8 { line }),
        ErrorKind::UnequalLengths {
            expected_len, len, ..
        } => Some(DecodeError::ColumnCount {
            line,
            expected: *expected_len as usize,
            found: *len as usize,
        }),
        _ => None,
    };

    mapped.unwrap_or(DecodeError::Malformed(err))
}

/// The csv reader silently closes a quote left open at end of input, so the
/// check happens up front. Returns the line the dangling quote opened on.
///
/// A quote only opens a quoted field at the start of a field; inside a
/// quoted field `""` is an escaped quote.
fn find_unterminated_quote(content: &[u8], delimiter: u8) -> Option<u64> {
    let mut line = 1u64;
    let mut opened_on = 0u64;
    let mut in_quotes = false;
    let mut field_start = true;
    let mut i = 0;

    while i < content.len() {
        let b = content[i];

        if in_quotes {
            if b == b'"' {
                if content.get(i + 1) == Some(&b'"') {
                    i += 1;
                } else {
                    in_quotes = false;
                }
            } else if b == b'\n' {
                line += 1;
            }
        } else if b == delimiter || b == b'\r' {
            field_start = true;
        } else if b == b'\n' {
            line += 1;
            field_start = true;
        } else if b == b'"' && field_start {
            in_quotes = true;
            opened_on = line;
            field_start = false;
        } else {
            field_start = false;
        }

        i += 1;
    }

    if in_quotes {
        Some(opened_on)
    } else {
        None
    }
}
