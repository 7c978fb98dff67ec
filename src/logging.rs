//! Request journal: a JSON-lines file plus an in-memory ring buffer of the
//! most recent entries, keyed by completion id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

const MAX_LOG_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Map a `[logging].level` name onto the journal's threshold.
    pub fn from_config(level: &str) -> Self {
        match level {
            "DEBUG" | "NOTSET" => Self::Debug,
            "WARNING" => Self::Warn,
            "ERROR" | "CRITICAL" => Self::Error,
            _ => Self::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            request_id: None,
            message: message.into(),
            context: None,
        }
    }

    pub fn for_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, ctx: serde_json::Value) -> Self {
        self.context = Some(ctx);
        self
    }
}

pub struct Logger {
    entries: VecDeque<LogEntry>,
    min_level: LogLevel,
    writer: Option<BufWriter<File>>,
}

impl Logger {
    /// Open (or create) the journal file, replaying existing entries into the buffer.
    pub fn new(file_path: impl AsRef<Path>, min_level: LogLevel) -> std::io::Result<Self> {
        let file_path = file_path.as_ref();

        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut entries = VecDeque::with_capacity(MAX_LOG_ENTRIES);

        if file_path.exists() {
            let reader = BufReader::new(File::open(file_path)?);
            for line in reader.lines().map_while(std::result::Result::ok) {
                if let Ok(entry) = serde_json::from_str::<LogEntry>(&line) {
                    push_bounded(&mut entries, entry);
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok(Self {
            entries,
            min_level,
            writer: Some(BufWriter::new(file)),
        })
    }

    /// A journal that only keeps entries in memory.
    pub fn in_memory(min_level: LogLevel) -> Self {
        Self {
            entries: VecDeque::new(),
            min_level,
            writer: None,
        }
    }

    pub fn log(&mut self, entry: LogEntry) {
        if entry.level < self.min_level {
            return;
        }
        if let Some(ref mut writer) = self.writer {
            if let Ok(json) = serde_json::to_string(&entry) {
                let _ = writeln!(writer, "{}", json);
                let _ = writer.flush();
            }
        }
        push_bounded(&mut self.entries, entry);
    }

    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn for_request(&self, request_id: &str) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.request_id.as_deref() == Some(request_id))
            .cloned()
            .collect()
    }
}

fn push_bounded(entries: &mut VecDeque<LogEntry>, entry: LogEntry) {
    if entries.len() >= MAX_LOG_ENTRIES {
        entries.pop_front();
    }
    entries.push_back(entry);
}

#[derive(Clone)]
pub struct SharedLogger(Arc<Mutex<Logger>>);

impl SharedLogger {
    pub fn new(file_path: impl AsRef<Path>, min_level: LogLevel) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(Logger::new(file_path, min_level)?))))
    }

    pub fn in_memory(min_level: LogLevel) -> Self {
        Self(Arc::new(Mutex::new(Logger::in_memory(min_level))))
    }

    pub fn log(&self, entry: LogEntry) {
        if let Ok(mut logger) = self.0.lock() {
            logger.log(entry);
        }
    }

    pub fn info(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Info, component, message));
    }

    pub fn warn(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Warn, component, message));
    }

    pub fn error(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Error, component, message));
    }

    pub fn debug(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Debug, component, message));
    }

    /// Record an entry tied to one completion id.
    pub fn request(
        &self,
        level: LogLevel,
        request_id: &str,
        component: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.log(LogEntry::new(level, component, message).for_request(request_id));
    }

    pub fn request_with_context(
        &self,
        level: LogLevel,
        request_id: &str,
        component: impl Into<String>,
        message: impl Into<String>,
        context: serde_json::Value,
    ) {
        self.log(
            LogEntry::new(level, component, message)
                .for_request(request_id)
                .with_context(context),
        );
    }

    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.0.lock().map(|l| l.recent(limit)).unwrap_or_default()
    }

    pub fn for_request(&self, request_id: &str) -> Vec<LogEntry> {
        self.0
            .lock()
            .map(|l| l.for_request(request_id))
            .unwrap_or_default()
    }
}
