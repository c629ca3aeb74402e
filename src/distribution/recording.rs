//! Event recording: JSON-lines by default, one object per event, with an
//! async writer task so recording never blocks the distribution path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{Error, Result};

use super::OutboundEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingFormat {
    JsonLines,
    Csv,
}

impl RecordingFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "jsonl" | "json_lines" | "json-lines" => Ok(RecordingFormat::JsonLines),
            "csv" => Ok(RecordingFormat::Csv),
            // Binary stays negotiable-per-config until someone defines a schema.
            other => Err(Error::validation(format!("unsupported recording format {other}"))),
        }
    }
}

/// One line of the JSON-lines format.
#[derive(Debug, Serialize)]
struct RecordLine<'a> {
    event: &'a str,
    timestamp: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
    payload: &'a serde_json::Value,
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn format_line(format: RecordingFormat, event: &OutboundEvent) -> Result<String> {
    match format {
        RecordingFormat::JsonLines => {
            let line = RecordLine {
                event: &event.event,
                timestamp: &event.timestamp,
                source: event.source.as_deref(),
                payload: &event.data,
            };
            let mut text = serde_json::to_string(&line)?;
            text.push('\n');
            Ok(text)
        }
        RecordingFormat::Csv => {
            let payload = serde_json::to_string(&event.data)?;
            Ok(format!(
                "{},{},{},{}\n",
                csv_escape(&event.event),
                csv_escape(&event.timestamp),
                csv_escape(event.source.as_deref().unwrap_or("")),
                csv_escape(&payload)
            ))
        }
    }
}

/// A single active recording.
pub struct Recorder {
    pub id: String,
    pub stream_id: String,
    pub format: RecordingFormat,
    pub file_path: PathBuf,
    tx: mpsc::Sender<OutboundEvent>,
    written: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    writer_task: tokio::task::JoinHandle<()>,
}

impl Recorder {
    pub async fn start(
        id: impl Into<String>,
        stream_id: impl Into<String>,
        format: RecordingFormat,
        file_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let id = id.into();
        let file_path: PathBuf = file_path.into();
        let mut file = tokio::fs::File::create(&file_path)
            .await
            .map_err(|e| Error::validation(format!("cannot create {}: {e}", file_path.display())))?;

        if format == RecordingFormat::Csv {
            file.write_all(b"event,timestamp,source,payload\n").await?;
        }

        let (tx, mut rx) = mpsc::channel::<OutboundEvent>(1024);
        let written = Arc::new(AtomicU64::new(0));
        let written_task = Arc::clone(&written);
        let rec_id = id.clone();

        let writer_task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match format_line(format, &event) {
                    Ok(line) => {
                        if let Err(e) = file.write_all(line.as_bytes()).await {
                            warn!(recording = %rec_id, error = %e, "recording write failed");
                            break;
                        }
                        written_task.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => warn!(recording = %rec_id, error = %e, "recording serialize failed"),
                }
            }
            let _ = file.flush().await;
        });

        info!(recording = %id, path = %file_path.display(), "recording started");
        Ok(Self {
            id,
            stream_id: stream_id.into(),
            format,
            file_path,
            tx,
            written,
            dropped: Arc::new(AtomicU64::new(0)),
            writer_task,
        })
    }

    /// Hand an event to the writer. Drops (and counts) when the writer is
    /// backed up.
    pub fn record(&self, event: OutboundEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for the writer to flush.
    pub async fn stop(self) -> u64 {
        drop(self.tx);
        let _ = self.writer_task.await;
        self.written.load(Ordering::Relaxed)
    }
}

/// Live recordings keyed by recording id.
#[derive(Default)]
pub struct RecordingRegistry {
    recordings: RwLock<HashMap<String, Arc<Recorder>>>,
}

impl RecordingRegistry {
    pub async fn start(
        &self,
        stream_id: &str,
        format: RecordingFormat,
        file_path: &str,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let recorder = Recorder::start(id.clone(), stream_id, format, file_path).await?;
        self.recordings.write().insert(id.clone(), Arc::new(recorder));
        Ok(id)
    }

    pub fn record_for_stream(&self, stream_id: &str, event: &OutboundEvent) {
        for recorder in self.recordings.read().values() {
            if recorder.stream_id == stream_id {
                recorder.record(event.clone());
            }
        }
    }

    pub async fn stop(&self, recording_id: &str) -> Result<u64> {
        let recorder = self
            .recordings
            .write()
            .remove(recording_id)
            .ok_or_else(|| Error::not_found(format!("recording {recording_id}")))?;
        let recorder = Arc::try_unwrap(recorder)
            .map_err(|_| Error::validation("recording still in use"))?;
        Ok(recorder.stop().await)
    }

    pub fn active(&self) -> Vec<(String, String)> {
        self.recordings
            .read()
            .values()
            .map(|r| (r.id.clone(), r.stream_id.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StreamKind;

    #[tokio::test]
    async fn json_lines_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.jsonl");

        let recorder = Recorder::start("r1", "stream-1", RecordingFormat::JsonLines, &path)
            .await
            .unwrap();
        recorder.record(
            OutboundEvent::new(StreamKind::Gaze, serde_json::json!({"x": 0.5})).with_source("gaze-0"),
        );
        recorder.record(OutboundEvent::new(StreamKind::Face, serde_json::json!({"faces": []})));
        let written = recorder.stop().await;
        assert_eq!(written, 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "gaze");
        assert_eq!(first["source"], "gaze-0");
        assert_eq!(first["payload"]["x"], 0.5);
    }

    #[tokio::test]
    async fn csv_has_header_and_escaping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.csv");

        let recorder = Recorder::start("r1", "stream-1", RecordingFormat::Csv, &path)
            .await
            .unwrap();
        recorder.record(OutboundEvent::new(
            StreamKind::Event,
            serde_json::json!({"name": "blink"}),
        ));
        recorder.stop().await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "event,timestamp,source,payload");
        assert!(lines[1].starts_with("event,"));
        // JSON payload contains quotes, so the field must be CSV-quoted.
        assert!(lines[1].contains(r#""{""name"":""blink""}""#));
    }

    #[test]
    fn format_parse_rejects_binary() {
        assert!(RecordingFormat::parse("jsonl").is_ok());
        assert!(RecordingFormat::parse("csv").is_ok());
        assert!(matches!(RecordingFormat::parse("binary"), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn registry_start_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reg.jsonl");
        let registry = RecordingRegistry::default();

        let id = registry
            .start("stream-1", RecordingFormat::JsonLines, path.to_str().unwrap())
            .await
            .unwrap();
        registry.record_for_stream(
            "stream-1",
            &OutboundEvent::new(StreamKind::Gaze, serde_json::json!({"x": 1.0})),
        );
        registry.record_for_stream(
            "other",
            &OutboundEvent::new(StreamKind::Gaze, serde_json::json!({"x": 2.0})),
        );

        // Give the writer a beat before stopping.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let written = registry.stop(&id).await.unwrap();
        assert_eq!(written, 1);
        assert!(matches!(registry.stop(&id).await, Err(Error::NotFound(_))));
    }
}
