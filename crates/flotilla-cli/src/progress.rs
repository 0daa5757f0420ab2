//! Progress and notification adapters.
//!
//! [`JsonlProgressWriter`] appends one JSON object per event to a log file,
//! so a run's timeline survives the process and can be tailed while the
//! fleet is running. [`TracingNotifier`] turns engine notifications into
//! structured log lines. Both are fire-and-forget: failures are logged and
//! swallowed, never propagated into the pipeline.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use flotilla_core::model::Notification;
use flotilla_core::traits::{NotificationSink, ProgressWriter};

/// Appends progress events as JSON lines.
pub struct JsonlProgressWriter {
    path: PathBuf,
    /// Serializes appends so concurrent issues never interleave a line.
    write_lock: Mutex<()>,
}

impl JsonlProgressWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl ProgressWriter for JsonlProgressWriter {
    async fn append_event(&self, text: &str) {
        let line = json!({
            "at": Utc::now().to_rfc3339(),
            "event": text,
        });

        let _guard = self.write_lock.lock().await;
        let result = async {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(format!("{line}\n").as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "could not append progress event");
        }
    }
}

/// Notification sink that logs every event.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl TracingNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn dispatch(&self, event: Notification) {
        info!(
            kind = %event.kind,
            scope = ?event.scope,
            payload = %event.payload,
            "notification"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_append_as_parsable_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("progress.jsonl");
        let writer = JsonlProgressWriter::new(&path);

        writer.append_event("Phase 1 started").await;
        writer.append_event("Phase 1 completed").await;

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "Phase 1 started");
        assert!(first["at"].is_string());
    }
}
