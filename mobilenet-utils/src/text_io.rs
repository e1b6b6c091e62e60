//! Readers and writers for the whitespace-separated float files used as
//! benchmark inputs and reference outputs.
//!
//! Both files are flat streams of decimal numbers; record boundaries are
//! implied by the record length (one image or one logit vector per record),
//! so line breaks carry no meaning.

use std::{fmt::Write as _, fs, path::Path};

use anyhow::{Context, Result};

/// Read exactly `count` records of `record_len` floats from `path`.
///
/// Values beyond the requested records are ignored with a debug log, which
/// lets a 10-case file drive a shorter run.
pub fn read_float_records<P: AsRef<Path>>(
    path: P,
    record_len: usize,
    count: usize,
) -> Result<Vec<Vec<f32>>> {
    let path = path.as_ref();
    anyhow::ensure!(record_len > 0, "record length must be greater than zero");
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read float file {}", path.display()))?;
    parse_float_records(&contents, record_len, count)
        .with_context(|| format!("invalid float data in {}", path.display()))
}

/// Parse `count` records of `record_len` floats from in-memory text.
pub fn parse_float_records(text: &str, record_len: usize, count: usize) -> Result<Vec<Vec<f32>>> {
    let wanted = record_len
        .checked_mul(count)
        .context("record count overflows usize")?;
    let mut tokens = text.split_ascii_whitespace();
    let mut records = Vec::with_capacity(count);
    for record_idx in 0..count {
        let mut record = Vec::with_capacity(record_len);
        for value_idx in 0..record_len {
            let position = record_idx * record_len + value_idx;
            let token = tokens.next().with_context(|| {
                format!("expected {wanted} values but the data ends after {position}")
            })?;
            let value = token.parse::<f32>().with_context(|| {
                format!("token {position} ('{token}') is not a floating-point number")
            })?;
            record.push(value);
        }
        records.push(record);
    }
    let leftover = tokens.count();
    if leftover > 0 {
        log::debug!("ignoring {leftover} trailing values after {count} record(s)");
    }
    Ok(records)
}

/// Write records in the same format: one record per line, space separated.
pub fn write_float_records<P: AsRef<Path>>(path: P, records: &[Vec<f32>]) -> Result<()> {
    let path = path.as_ref();
    let mut out = String::new();
    for record in records {
        for (idx, value) in record.iter().enumerate() {
            if idx > 0 {
                out.push(' ');
            }
            // `{:?}` prints the shortest string that parses back to the same f32.
            write!(out, "{value:?}").context("format float record")?;
        }
        out.push('\n');
    }
    fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn records_ignore_line_layout() {
        let text = "1 2\n3\n\t4 5 6\n";
        let records = parse_float_records(text, 3, 2).expect("parse");
        assert_eq!(records, vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
    }

    #[test]
    fn short_file_is_rejected() {
        let err = parse_float_records("1 2 3 4", 3, 2).expect_err("too short");
        assert!(format!("{err:#}").contains("expected 6 values"));
    }

    #[test]
    fn non_numeric_token_is_rejected() {
        let err = parse_float_records("1 two 3", 3, 1).expect_err("bad token");
        assert!(format!("{err:#}").contains("'two'"));
    }

    #[test]
    fn scientific_notation_and_trailing_values_are_accepted() {
        let records = parse_float_records("1e-3 -2.5E2 7 8 9", 2, 1).expect("parse");
        assert_eq!(records, vec![vec![0.001, -250.0]]);
    }

    #[test]
    fn written_records_read_back_exactly() {
        let file = NamedTempFile::new().expect("tempfile");
        let records = vec![vec![0.1f32, -3.25, 1.0e-7], vec![6.0, 0.0, 123_456.79]];
        write_float_records(file.path(), &records).expect("write");
        let loaded = read_float_records(file.path(), 3, 2).expect("read");
        assert_eq!(loaded, records);
    }
}
