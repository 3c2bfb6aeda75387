//! Isolate meta file parser
//!
//! After a run with `--meta`, isolate writes one `key:value` pair per line
//! (`time`, `time-wall`, `max-rss`, `status`, `exitcode`, `exitsig`, ...).
//! The key set varies with the outcome, so every derived field is optional.

use std::collections::HashMap;

/// Termination status from the `status` key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecStatus {
    /// No `status` key: the program exited on its own with code 0
    Ok,
    /// `RE`: non-zero exit code
    RuntimeError,
    /// `SG`: killed by a signal, number from `exitsig` when present
    Signaled(Option<i32>),
    /// `TO`: CPU or wall-clock limit hit
    TimedOut,
    /// `XX`: isolate itself failed
    InternalError,
    /// Anything isolate may add later
    Unknown(String),
}

/// Parsed execution-metadata record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceUsage {
    /// The record as read, trimmed
    pub raw: String,
    fields: HashMap<String, String>,
    /// CPU time in seconds
    pub time: Option<f64>,
    /// Peak resident set size in KB
    pub max_rss: Option<f64>,
}

impl ResourceUsage {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn status(&self) -> ExecStatus {
        match self.get("status") {
            None => ExecStatus::Ok,
            Some("RE") => ExecStatus::RuntimeError,
            Some("SG") => ExecStatus::Signaled(self.numeric("exitsig").map(|sig| sig as i32)),
            Some("TO") => ExecStatus::TimedOut,
            Some("XX") => ExecStatus::InternalError,
            Some(other) => ExecStatus::Unknown(other.to_string()),
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.get("exitcode").and_then(|v| v.parse().ok())
    }

    pub fn wall_time(&self) -> Option<f64> {
        self.numeric("time-wall")
    }

    fn numeric(&self, key: &str) -> Option<f64> {
        self.get(key)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }
}

/// Parse isolate meta file content.
///
/// Blank lines and lines without a `:` are skipped; the value is everything
/// after the first `:`.
pub fn parse_meta(content: &str) -> ResourceUsage {
    let mut usage = ResourceUsage {
        raw: content.trim().to_string(),
        ..Default::default()
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        usage
            .fields
            .insert(key.trim().to_string(), value.trim().to_string());
    }

    usage.time = usage.numeric("time");
    usage.max_rss = usage.numeric("max-rss");
    usage
}
