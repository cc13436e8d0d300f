//! Where scenario results go.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tunnelcheck_common::models::ScenarioResult;

pub trait ResultSink {
    fn record(&mut self, result: &ScenarioResult) -> io::Result<()>;
}

pub const CSV_HEADER: &str =
    "timestamp,scenario,mode,target,pre_identifier,post_identifier,elapsed_recovery_s,outcome,notes";

/// Appends one row per result. The header is written only when the file
/// is new or empty, so repeated batches accumulate in one file.
pub struct CsvSink {
    path: PathBuf,
    file: File,
}

impl CsvSink {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let fresh = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if fresh {
            writeln!(file, "{CSV_HEADER}")?;
        }
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn row(result: &ScenarioResult) -> String {
        let elapsed = result
            .elapsed_recovery_secs()
            .map(|s| format!("{s:.3}"))
            .unwrap_or_default();
        [
            result.timestamp.to_rfc3339(),
            result.scenario.clone(),
            result.mode.to_string(),
            result.target.clone(),
            ScenarioResult::identifiers_label(&result.pre_identifiers),
            ScenarioResult::identifiers_label(&result.post_identifiers),
            elapsed,
            result.outcome.to_string(),
            result.notes_text(),
        ]
        .iter()
        .map(|field| escape(field))
        .collect::<Vec<_>>()
        .join(",")
    }
}

impl ResultSink for CsvSink {
    fn record(&mut self, result: &ScenarioResult) -> io::Result<()> {
        writeln!(self.file, "{}", Self::row(result))?;
        self.file.flush()
    }
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// One JSON object per line, with the full result including workload stats.
pub struct JsonLinesSink {
    file: File,
}

impl JsonLinesSink {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl ResultSink for JsonLinesSink {
    fn record(&mut self, result: &ScenarioResult) -> io::Result<()> {
        let line = serde_json::to_string(result).map_err(io::Error::other)?;
        writeln!(self.file, "{line}")?;
        self.file.flush()
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    results: Vec<ScenarioResult>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> &[ScenarioResult] {
        &self.results
    }
}

impl ResultSink for MemorySink {
    fn record(&mut self, result: &ScenarioResult) -> io::Result<()> {
        self.results.push(result.clone());
        Ok(())
    }
}

/// Fans each result out to several sinks. Every sink is tried; the first
/// error is returned.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Box<dyn ResultSink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ResultSink for MultiSink {
    fn record(&mut self, result: &ScenarioResult) -> io::Result<()> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.record(result) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
