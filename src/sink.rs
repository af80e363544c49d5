//! Emission boundary: writes metric records to stdout or a file.

use crate::error::Result;
use crate::metrics::{Fields, MetricRecord, MetricValue, Tags};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// Receives one call per metric record. Implementations may drop records
/// they cannot represent.
pub trait Sink: Send {
    fn emit(&mut self, name: &str, fields: &Fields, tags: &Tags) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn emit_record(&mut self, record: &MetricRecord) -> Result<()> {
        self.emit(&record.name, &record.fields, &record.tags)
    }
}

/// Open `path` for appending, or stdout when no path is given.
pub fn open_writer(path: Option<&Path>) -> Result<Box<dyn Write + Send>> {
    match path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(io::stdout())),
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    timestamp: DateTime<Utc>,
    name: &'a str,
    tags: &'a Tags,
    fields: &'a Fields,
}

/// One JSON object per line
pub struct JsonLinesSink<W: Write + Send> {
    writer: BufWriter<W>,
    records_written: u64,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            records_written: 0,
        }
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }
}

impl<W: Write + Send> Sink for JsonLinesSink<W> {
    fn emit(&mut self, name: &str, fields: &Fields, tags: &Tags) -> Result<()> {
        let record = JsonRecord {
            timestamp: Utc::now(),
            name,
            tags,
            fields,
        };
        let json = serde_json::to_string(&record).map_err(io::Error::from)?;
        writeln!(self.writer, "{}", json)?;
        self.records_written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> Drop for JsonLinesSink<W> {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// InfluxDB line protocol. Records without fields cannot be represented
/// and are skipped.
pub struct LineProtocolSink<W: Write + Send> {
    writer: BufWriter<W>,
    records_written: u64,
}

impl<W: Write + Send> LineProtocolSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            records_written: 0,
        }
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }
}

impl<W: Write + Send> Sink for LineProtocolSink<W> {
    fn emit(&mut self, name: &str, fields: &Fields, tags: &Tags) -> Result<()> {
        if fields.is_empty() {
            debug!(name = %name, "Skipping record without fields");
            return Ok(());
        }
        let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let line = format_line(name, fields, tags);
        writeln!(self.writer, "{} {}", line, timestamp)?;
        self.records_written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> Drop for LineProtocolSink<W> {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Render `measurement,tags fields` without the timestamp.
pub fn format_line(name: &str, fields: &Fields, tags: &Tags) -> String {
    let mut line = escape(name, &[',', ' ']);
    for (key, value) in tags {
        line.push(',');
        line.push_str(&escape(key, &[',', '=', ' ']));
        line.push('=');
        line.push_str(&escape(value, &[',', '=', ' ']));
    }
    let rendered: Vec<String> = fields
        .iter()
        .map(|(key, value)| {
            let value = match value {
                MetricValue::Int(v) => format!("{}i", v),
                MetricValue::Float(v) => format!("{}", v),
            };
            format!("{}={}", escape(key, &[',', '=', ' ']), value)
        })
        .collect();
    line.push(' ');
    line.push_str(&rendered.join(","));
    line
}

fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if special.contains(&c) || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
