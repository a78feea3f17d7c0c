//! FASTA records, just enough to split a sequence file into batches.

use crate::error::{Error, Result};
use std::fmt::Write as _;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Header text up to the first whitespace.
    pub name: String,
    /// Full header line without the leading `>`.
    pub header: String,
    pub sequence: String,
}

/// Parse FASTA text. Sequence lines are concatenated; blank lines ignored.
pub fn parse(text: &str) -> Result<Vec<Record>> {
    let mut records: Vec<Record> = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('>') {
            let name = header.split_whitespace().next().unwrap_or("").to_string();
            if name.is_empty() {
                return Err(Error::Validation(format!(
                    "FASTA record without a name at line {}",
                    lineno + 1
                )));
            }
            records.push(Record {
                name,
                header: header.to_string(),
                sequence: String::new(),
            });
        } else {
            match records.last_mut() {
                Some(record) => record.sequence.push_str(line.trim()),
                None => {
                    return Err(Error::Validation(format!(
                        "Sequence data before first FASTA header at line {}",
                        lineno + 1
                    )))
                }
            }
        }
    }
    Ok(records)
}

pub fn read(path: &Path) -> Result<Vec<Record>> {
    parse(&std::fs::read_to_string(path)?)
}

pub fn render(records: &[Record]) -> String {
    let mut out = String::new();
    for record in records {
        let _ = writeln!(out, ">{}", record.header);
        let _ = writeln!(out, "{}", record.sequence);
    }
    out
}

pub fn write(path: &Path, records: &[Record]) -> Result<()> {
    std::fs::write(path, render(records))?;
    Ok(())
}
