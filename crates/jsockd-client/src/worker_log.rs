//! Reassembly of the worker's diagnostic stream.
//!
//! jsockd writes log lines to stderr as
//! `<marker> jsockd <RFC 3339 timestamp> [<LEVEL>] <message>`. A `*` marker
//! continues a multi-line message, a `$` marker ends it. Anything that does not
//! match is passed through as an INFO message.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, FixedOffset, SecondsFormat};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Unanchored so that a `JSOCKD_LOG_PREFIX` in front of the marker is tolerated.
static LOG_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\*|\$) jsockd ([^ ]+) \[([^\]\[]+)\] (.*)").expect("valid log line pattern")
});

const DEFAULT_LEVEL: &str = "INFO";

/// One complete worker log message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Absent for pass-through lines and lines with a bad timestamp.
    pub timestamp: Option<DateTime<FixedOffset>>,
    /// Level as written by the worker, e.g. `INFO` or `ERROR`.
    pub level: String,
    pub message: String,
}

impl LogEntry {
    fn untimed(level: &str, message: &str) -> Self {
        Self {
            timestamp: None,
            level: level.to_string(),
            message: message.to_string(),
        }
    }
}

/// Receives reassembled worker log messages. Called from a background task.
pub trait LogSink: Send + Sync {
    fn log(&self, entry: LogEntry);
}

impl<F> LogSink for F
where
    F: Fn(LogEntry) + Send + Sync,
{
    fn log(&self, entry: LogEntry) {
        self(entry)
    }
}

/// Re-emits worker messages as tracing events with target `jsockd`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, entry: LogEntry) {
        let ts = entry
            .timestamp
            .map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true));
        let ts = ts.as_deref();
        let message = entry.message.as_str();
        match entry.level.to_ascii_uppercase().as_str() {
            "ERROR" | "FATAL" => tracing::error!(target: "jsockd", worker_ts = ts, "{message}"),
            "WARN" | "WARNING" => tracing::warn!(target: "jsockd", worker_ts = ts, "{message}"),
            "DEBUG" => tracing::debug!(target: "jsockd", worker_ts = ts, "{message}"),
            "TRACE" => tracing::trace!(target: "jsockd", worker_ts = ts, "{message}"),
            _ => tracing::info!(target: "jsockd", worker_ts = ts, "{message}"),
        }
    }
}

/// Line-by-line state machine joining `*` continuation lines.
#[derive(Debug, Default)]
pub struct LogAssembler {
    pending: String,
}

impl LogAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&mut self, message: &str) {
        if !self.pending.is_empty() {
            self.pending.push('\n');
        }
        self.pending.push_str(message);
    }

    /// Feed one line; returns a message when one is complete.
    pub fn push_line(&mut self, line: &str) -> Option<LogEntry> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(caps) = LOG_LINE.captures(line) else {
            return Some(LogEntry::untimed(DEFAULT_LEVEL, line));
        };
        let (marker, timestamp, level, message) = (&caps[1], &caps[2], &caps[3], &caps[4]);

        let Ok(timestamp) = DateTime::parse_from_rfc3339(timestamp) else {
            return Some(LogEntry::untimed(level, message));
        };

        self.append(message);
        if marker == "*" {
            return None;
        }
        Some(LogEntry {
            timestamp: Some(timestamp),
            level: level.to_string(),
            message: std::mem::take(&mut self.pending),
        })
    }

    /// Flush whatever is pending at end of stream.
    pub fn finish(&mut self) -> Option<LogEntry> {
        if self.pending.is_empty() {
            return None;
        }
        Some(LogEntry {
            timestamp: None,
            level: DEFAULT_LEVEL.to_string(),
            message: std::mem::take(&mut self.pending),
        })
    }
}

/// Forward a diagnostic stream to `sink` until it closes.
///
/// Invalid UTF-8 is replaced rather than treated as an error.
pub async fn forward_diagnostics<R>(stream: R, sink: Arc<dyn LogSink>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut assembler = LogAssembler::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if let Some(entry) = assembler.push_line(&String::from_utf8_lossy(&buf)) {
                    sink.log(entry);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Diagnostic stream read failed");
                break;
            }
        }
    }
    if let Some(entry) = assembler.finish() {
        sink.log(entry);
    }
    tracing::trace!("Diagnostic stream closed");
}
