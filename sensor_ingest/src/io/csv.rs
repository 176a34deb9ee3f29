//! CSV row codec for chunk and session files.
//!
//! Layout:
//! ```text
//! timestamp,sensor_id,mode,value,temperature,supply_voltage
//! 2025-06-01T12:00:00.000Z,SYNC_START,,,,
//! 2025-06-01T12:00:00.250Z,ctd-uw-01,continuous,12.5,8.25,
//! 2025-06-01T12:00:59.750Z,SYNC_STOP,,,,
//! ```
//! Boundary rows carry the flush-edge timestamp in the first column and the marker
//! name in the `sensor_id` column. Empty optional columns decode to `None`.
//! Fields containing a comma, quote or newline are quoted with doubled quotes.

use chrono::{DateTime, SecondsFormat, Utc};
use snafu::{ResultExt, Snafu};

use crate::models::reading::Reading;

/// Header row shared by chunk files and consolidated session files.
pub const HEADER: &str = "timestamp,sensor_id,mode,value,temperature,supply_voltage";

const COLUMNS: usize = 6;

/// Synthetic rows marking buffer-flush edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// First row after the header.
    SyncStart,
    /// Last row of the file.
    SyncStop,
}

impl Marker {
    /// Wire spelling.
    pub const fn as_str(self) -> &'static str {
        match self {
            Marker::SyncStart => "SYNC_START",
            Marker::SyncStop => "SYNC_STOP",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "SYNC_START" => Some(Marker::SyncStart),
            "SYNC_STOP" => Some(Marker::SyncStop),
            _ => None,
        }
    }
}

/// One decoded data row.
#[derive(Debug, Clone, PartialEq)]
pub enum CsvRow {
    /// An instrument sample.
    Reading(Reading),
    /// A flush-edge boundary row.
    Marker {
        /// Which boundary.
        marker: Marker,
        /// Flush-edge time.
        timestamp: DateTime<Utc>,
    },
}

/// Errors raised while decoding CSV text.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CodecError {
    /// The first line is not [`HEADER`].
    #[snafu(display("missing or unexpected CSV header"))]
    MissingHeader,

    /// A row does not have six columns.
    #[snafu(display("line {line}: expected 6 fields, found {found}"))]
    FieldCount {
        /// 1-based line number.
        line: usize,
        /// Columns found.
        found: usize,
    },

    /// The timestamp column is not RFC 3339.
    #[snafu(display("line {line}: bad timestamp {value:?}: {source}"))]
    Timestamp {
        /// 1-based line number.
        line: usize,
        /// Raw value.
        value: String,
        /// Parser error.
        source: chrono::ParseError,
    },

    /// A numeric column does not parse.
    #[snafu(display("line {line}: bad number in column {column}: {source}"))]
    Number {
        /// 1-based line number.
        line: usize,
        /// Column name.
        column: &'static str,
        /// Parser error.
        source: std::num::ParseFloatError,
    },

    /// A quoted field runs to the end of the line.
    #[snafu(display("line {line}: unterminated quoted field"))]
    Unterminated {
        /// 1-based line number.
        line: usize,
    },
}

/// Formats a timestamp the way every file in the store does (RFC 3339, millis, `Z`).
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn push_field(out: &mut String, field: &str) {
    if field.contains([',', '"', '\n', '\r']) {
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(field);
    }
}

fn push_opt(out: &mut String, v: Option<f64>) {
    if let Some(v) = v {
        out.push_str(&v.to_string());
    }
}

/// Appends one reading as a CSV line (with trailing newline).
pub fn encode_reading(out: &mut String, r: &Reading) {
    out.push_str(&format_timestamp(r.timestamp));
    out.push(',');
    push_field(out, &r.sensor_id);
    out.push(',');
    push_field(out, &r.mode);
    out.push(',');
    out.push_str(&r.value.to_string());
    out.push(',');
    push_opt(out, r.temperature);
    out.push(',');
    push_opt(out, r.supply_voltage);
    out.push('\n');
}

/// Appends a boundary row (with trailing newline).
pub fn encode_marker(out: &mut String, marker: Marker, ts: DateTime<Utc>) {
    out.push_str(&format_timestamp(ts));
    out.push(',');
    out.push_str(marker.as_str());
    out.push_str(",,,,\n");
}

/// Encodes a complete bracketed document: header, `SYNC_START`, readings, `SYNC_STOP`.
pub fn encode_document(
    readings: &[Reading],
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
) -> String {
    let mut out = String::with_capacity(64 * (readings.len() + 3));
    out.push_str(HEADER);
    out.push('\n');
    encode_marker(&mut out, Marker::SyncStart, start);
    for r in readings {
        encode_reading(&mut out, r);
    }
    encode_marker(&mut out, Marker::SyncStop, stop);
    out
}

fn split_fields(line: &str, line_no: usize) -> Result<Vec<String>, CodecError> {
    let mut fields = Vec::with_capacity(COLUMNS);
    let mut cur = String::new();
    let mut chars = line.chars().peekable();
    let mut quoted = false;
    while let Some(c) = chars.next() {
        if quoted {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    cur.push('"');
                    chars.next();
                } else {
                    quoted = false;
                }
            } else {
                cur.push(c);
            }
        } else {
            match c {
                ',' => fields.push(std::mem::take(&mut cur)),
                '"' if cur.is_empty() => quoted = true,
                _ => cur.push(c),
            }
        }
    }
    if quoted {
        return UnterminatedSnafu { line: line_no }.fail();
    }
    fields.push(cur);
    Ok(fields)
}

fn parse_opt(raw: &str, line: usize, column: &'static str) -> Result<Option<f64>, CodecError> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<f64>()
        .map(Some)
        .context(NumberSnafu { line, column })
}

/// Decodes one data line. `line_no` is only used in error messages.
pub fn parse_row(line: &str, line_no: usize) -> Result<CsvRow, CodecError> {
    let fields = split_fields(line, line_no)?;
    if fields.len() != COLUMNS {
        return FieldCountSnafu {
            line: line_no,
            found: fields.len(),
        }
        .fail();
    }
    let timestamp = DateTime::parse_from_rfc3339(&fields[0])
        .context(TimestampSnafu {
            line: line_no,
            value: fields[0].clone(),
        })?
        .with_timezone(&Utc);

    if let Some(marker) = Marker::parse(&fields[1]) {
        return Ok(CsvRow::Marker { marker, timestamp });
    }

    let value = fields[3].parse::<f64>().context(NumberSnafu {
        line: line_no,
        column: "value",
    })?;
    Ok(CsvRow::Reading(Reading {
        timestamp,
        sensor_id: fields[1].clone(),
        mode: fields[2].clone(),
        value,
        temperature: parse_opt(&fields[4], line_no, "temperature")?,
        supply_voltage: parse_opt(&fields[5], line_no, "supply_voltage")?,
    }))
}

/// Decodes a whole file. The first line must be [`HEADER`]; blank lines are skipped.
pub fn parse_document(text: &str) -> Result<Vec<CsvRow>, CodecError> {
    let mut lines = text.lines().enumerate();
    match lines.next() {
        Some((_, first)) if first.trim_end() == HEADER => {}
        _ => return MissingHeaderSnafu.fail(),
    }
    lines
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| parse_row(l.trim_end_matches('\r'), i + 1))
        .collect()
}

/// Keeps only the readings of a decoded document, in file order.
pub fn readings_only(rows: Vec<CsvRow>) -> Vec<Reading> {
    rows.into_iter()
        .filter_map(|r| match r {
            CsvRow::Reading(r) => Some(r),
            CsvRow::Marker { .. } => None,
        })
        .collect()
}
