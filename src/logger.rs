use std::fs::{File, OpenOptions};
use std::io::Write;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::types::{Device, FanState};

/// Append-only NDJSON capture of engine traffic: refresh snapshots,
/// outgoing pushes and transport faults. Meant for offline inspection of
/// vendor API quirks; write failures degrade to a warning and never
/// disturb the sync path.
pub(crate) struct CaptureLog {
    file: File,
}

impl CaptureLog {
    pub fn new(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    pub fn log_refresh(&mut self, device: &Device, fan: Option<&FanState>) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "refresh",
            "device": device,
            "fan": fan,
        });
        self.write_line(&entry);
    }

    pub fn log_push(&mut self, channel: &str, payload: &Value) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "push",
            "channel": channel,
            "payload": payload,
        });
        self.write_line(&entry);
    }

    pub fn log_fault(&mut self, context: &str, error: &str) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "fault",
            "context": context,
            "error": error,
        });
        self.write_line(&entry);
    }

    fn write_line(&mut self, entry: &Value) {
        if let Ok(line) = serde_json::to_string(entry)
            && let Err(e) = writeln!(self.file, "{line}")
        {
            warn!("failed to write capture log entry: {e}");
        }
    }
}
