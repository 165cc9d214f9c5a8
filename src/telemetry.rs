//! telemetry.rs
//!
//! Append-only JSONL sinks and pretty-JSON dump files for run artifacts.
//!
//! # Behaviour
//!
//! - A sink lazily opens its file on first write, creating parent
//!   directories as needed.
//! - Each record is one JSON object per line, flushed immediately so an
//!   interrupted run still leaves complete lines behind.
//! - Write failures are logged once and disable the sink for the rest of the
//!   process; they never abort a battle.
//!
//! Sinks are not internally synchronized. Share one across battles behind a
//! `Mutex` (see [`SharedSink`]).

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::warn;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkMode {
    Off,
    Jsonl,
}

/// A JSONL sink bound to one file.
#[derive(Debug)]
pub struct JsonlSink {
    mode: SinkMode,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

pub type SharedSink = Arc<Mutex<JsonlSink>>;

impl JsonlSink {
    /// Append-mode sink; the file opens on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            mode: SinkMode::Jsonl,
            path: path.into(),
            writer: None,
        }
    }

    /// A sink that only writes when `enabled`.
    pub fn enabled_if(path: impl Into<PathBuf>, enabled: bool) -> Self {
        let mut sink = Self::new(path);
        if !enabled {
            sink.mode = SinkMode::Off;
        }
        sink
    }

    pub fn shared(self) -> SharedSink {
        Arc::new(Mutex::new(self))
    }

    pub fn is_enabled(&self) -> bool {
        self.mode == SinkMode::Jsonl
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_writer(&mut self) -> Option<&mut BufWriter<File>> {
        if self.mode != SinkMode::Jsonl {
            return None;
        }
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(f) => self.writer = Some(BufWriter::new(f)),
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "jsonl sink open failed; disabling");
                    self.mode = SinkMode::Off;
                    return None;
                }
            }
        }
        self.writer.as_mut()
    }

    /// Serialize any record and write it as a line.
    pub fn log<T: Serialize>(&mut self, record: &T) {
        match serde_json::to_string(record) {
            Ok(line) => self.write_line(&line),
            Err(err) => warn!(path = %self.path.display(), error = %err, "jsonl record not serializable"),
        }
    }

    fn write_line(&mut self, line: &str) {
        let Some(writer) = self.ensure_writer() else {
            return;
        };
        let res = writeln!(writer, "{line}").and_then(|_| writer.flush());
        if let Err(err) = res {
            warn!(path = %self.path.display(), error = %err, "jsonl sink write failed; disabling");
            self.mode = SinkMode::Off;
            self.writer = None;
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

/// Lock a shared sink and write one record. A poisoned lock drops the record.
pub fn log_shared<T: Serialize>(sink: &SharedSink, record: &T) {
    if let Ok(mut guard) = sink.lock() {
        guard.log(record);
    }
}

/// Pretty-printed JSON file, replacing any existing file.
pub fn write_json_file(path: &Path, value: &JsonValue) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    fs::write(path, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_jsonl_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.jsonl");
        {
            let mut sink = JsonlSink::new(&path);
            sink.log(&json!({"a": 1}));
            sink.log(&json!({"b": 2}));
        }
        {
            let mut sink = JsonlSink::new(&path);
            sink.log(&json!({"c": 3}));
        }
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3, "append mode keeps earlier lines");
        let v: JsonValue = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(v["c"], 3);
    }

    #[test]
    fn test_disabled_sink_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("off.jsonl");
        let mut sink = JsonlSink::enabled_if(&path, false);
        sink.log(&json!({"x": 1}));
        assert!(!path.exists());
        assert!(!sink.is_enabled());
    }

    #[test]
    fn test_write_json_file_is_pretty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dumps").join("d.json");
        write_json_file(&path, &json!({"reason": "mask_zero", "turn": 3})).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains('\n'), "dump should be multi-line");
        let v: JsonValue = serde_json::from_str(&text).unwrap();
        assert_eq!(v["reason"], "mask_zero");
    }
}
