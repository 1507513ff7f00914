//! Crash report sinks.

use crate::types::CrashReport;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Receives crash reports keyed by test number.
pub trait ReportSink: Send {
    fn report_crash(&mut self, report: &CrashReport) -> std::io::Result<()>;
}

/// Appends one JSON object per crash to a file.
#[derive(Debug, Clone)]
pub struct JsonlReportSink {
    path: PathBuf,
}

impl JsonlReportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every report in the file, skipping malformed lines.
    pub fn load(path: &Path) -> std::io::Result<Vec<CrashReport>> {
        let reader = BufReader::new(File::open(path)?);
        let mut reports = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CrashReport>(&line) {
                Ok(report) => reports.push(report),
                Err(e) => warn!("Skipping invalid crash log line: {}", e),
            }
        }
        Ok(reports)
    }
}

impl ReportSink for JsonlReportSink {
    fn report_crash(&mut self, report: &CrashReport) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let json = serde_json::to_string(report)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        debug!(
            "Crash for test {} appended to {}",
            report.test_number,
            self.path.display()
        );
        Ok(())
    }
}

/// Keeps reports in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryReportSink {
    pub reports: Vec<CrashReport>,
}

impl ReportSink for MemoryReportSink {
    fn report_crash(&mut self, report: &CrashReport) -> std::io::Result<()> {
        self.reports.push(report.clone());
        Ok(())
    }
}
