use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use instacrop_core::{TelemetryEvent, TelemetrySink};
use reqwest::blocking::Client;
use serde::Serialize;

pub const SINK_ENV: &str = "INSTACROP_TELEMETRY_SINK";
pub const FILE_ENV: &str = "INSTACROP_TELEMETRY_FILE";
pub const ENDPOINT_ENV: &str = "INSTACROP_TELEMETRY_ENDPOINT";

pub fn sink_from_env() -> Option<Box<dyn TelemetrySink>> {
    let mode = std::env::var(SINK_ENV).ok()?;
    match mode.trim().to_ascii_lowercase().as_str() {
        "stdout" => Some(Box::new(StdoutSink)),
        "stderr" => Some(Box::new(StderrSink)),
        "file" => {
            let path = std::env::var(FILE_ENV)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .or_else(default_telemetry_file)?;
            Some(Box::new(FileSink::new(path)))
        }
        "http" => {
            let endpoint = std::env::var(ENDPOINT_ENV).ok().filter(|v| !v.trim().is_empty())?;
            Some(Box::new(HttpSink::new(endpoint)))
        }
        _ => None,
    }
}

pub fn default_telemetry_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".instacrop").join("telemetry.jsonl"))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryEnvelope {
    event_type: String,
    format: Option<String>,
    platform: String,
    duration_ms: Option<u64>,
    detail: Option<String>,
}

impl From<&TelemetryEvent> for TelemetryEnvelope {
    fn from(event: &TelemetryEvent) -> Self {
        Self {
            event_type: format!("{:?}", event.event_type),
            format: event.format.map(|kind| kind.key().to_string()),
            platform: format!("{:?}", event.platform),
            duration_ms: event.duration_ms,
            detail: event.detail.clone(),
        }
    }
}

fn envelope_line(event: &TelemetryEvent) -> Option<String> {
    serde_json::to_string(&TelemetryEnvelope::from(event)).ok()
}

pub struct StdoutSink;

impl TelemetrySink for StdoutSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Some(line) = envelope_line(&event) {
            println!("{}", line);
        }
    }
}

/// Keeps stdout free for command output.
pub struct StderrSink;

impl TelemetrySink for StderrSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Some(line) = envelope_line(&event) {
            eprintln!("{}", line);
        }
    }
}

pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn write_line(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("creating telemetry log parent directory")?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("opening telemetry file")?;
        writeln!(file, "{}", line).context("writing telemetry line")?;
        Ok(())
    }
}

impl TelemetrySink for FileSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Some(line) = envelope_line(&event) {
            let _ = self.write_line(&line);
        }
    }
}

pub struct HttpSink {
    endpoint: String,
    client: Client,
}

impl HttpSink {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: Client::new(),
        }
    }
}

impl TelemetrySink for HttpSink {
    fn emit(&self, event: TelemetryEvent) {
        let payload = TelemetryEnvelope::from(&event);
        let _ = self.client.post(&self.endpoint).json(&payload).send();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instacrop_core::{FormatKind, PlatformTarget, TelemetryEventType};

    fn sample_event() -> TelemetryEvent {
        TelemetryEvent {
            event_type: TelemetryEventType::EncodeAttempt,
            format: Some(FormatKind::StoryReels),
            platform: PlatformTarget::Cli,
            duration_ms: None,
            detail: Some("quality=92,bytes=1000".to_string()),
        }
    }

    #[test]
    fn envelope_uses_format_key_and_camel_case() {
        let line = envelope_line(&sample_event()).expect("serializes");
        let value: serde_json::Value = serde_json::from_str(&line).expect("json");
        assert_eq!(value["eventType"], "EncodeAttempt");
        assert_eq!(value["format"], "story_reels");
        assert_eq!(value["platform"], "Cli");
        assert!(value["durationMs"].is_null());
    }

    #[test]
    fn file_sink_appends_one_line_per_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("events.jsonl");
        let sink = FileSink::new(path.clone());
        sink.emit(sample_event());
        sink.emit(sample_event());
        let contents = std::fs::read_to_string(&path).expect("telemetry file");
        assert_eq!(contents.lines().count(), 2);
    }
}
