//! Metric sinks for the orchestration loop.
//!
//! The loop only ever emits scalars and text blocks tagged with a step, so
//! the sink seam stays small. `JsonlDashboard` appends one JSON object per
//! event for offline plotting; `MemoryDashboard` records events for tests.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;

use progfill_core::{IoResultExt, Result};

pub trait DashboardSink: Send {
    fn scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;
    fn text(&mut self, tag: &str, text: &str, step: usize) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Event<'a> {
    Scalar { tag: &'a str, value: f64, step: usize },
    Text { tag: &'a str, text: &'a str, step: usize },
}

/// Append-only JSONL sink under the run directory.
pub struct JsonlDashboard {
    path: String,
    file: File,
}

impl JsonlDashboard {
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).with_path(dir)?;
        let path = dir.join("events.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_path(&path)?;
        Ok(Self {
            path: path.display().to_string(),
            file,
        })
    }

    fn write_event(&mut self, event: &Event<'_>) -> Result<()> {
        let mut line = serde_json::to_string(event)
            .map_err(|e| progfill_core::SynthError::Data(e.to_string()))?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .with_path(&self.path)?;
        Ok(())
    }
}

impl DashboardSink for JsonlDashboard {
    fn scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.write_event(&Event::Scalar { tag, value, step })
    }

    fn text(&mut self, tag: &str, text: &str, step: usize) -> Result<()> {
        self.write_event(&Event::Text { tag, text, step })
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush().with_path(&self.path)
    }
}

/// In-memory recording sink.
#[derive(Debug, Default)]
pub struct MemoryDashboard {
    scalars: Mutex<Vec<(String, f64, usize)>>,
    texts: Mutex<Vec<(String, String, usize)>>,
}

impl MemoryDashboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalars(&self) -> Vec<(String, f64, usize)> {
        self.scalars.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<(String, String, usize)> {
        self.texts.lock().unwrap().clone()
    }

    pub fn scalar_values(&self, tag: &str) -> Vec<(usize, f64)> {
        self.scalars()
            .into_iter()
            .filter(|(t, _, _)| t == tag)
            .map(|(_, v, s)| (s, v))
            .collect()
    }
}

impl DashboardSink for MemoryDashboard {
    fn scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.scalars.lock().unwrap().push((tag.into(), value, step));
        Ok(())
    }

    fn text(&mut self, tag: &str, text: &str, step: usize) -> Result<()> {
        self.texts.lock().unwrap().push((tag.into(), text.into(), step));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_dashboard_appends_events() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dash = JsonlDashboard::create(tmp.path()).unwrap();
        dash.scalar("train/loss", 1.5, 1000).unwrap();
        dash.text("predict/samples", "ios: a > b", 1000).unwrap();
        dash.flush().unwrap();

        let raw = fs::read_to_string(tmp.path().join("events.jsonl")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "scalar");
        assert_eq!(first["tag"], "train/loss");
        assert_eq!(first["step"], 1000);
    }

    #[test]
    fn test_memory_dashboard_filters_by_tag() {
        let mut dash = MemoryDashboard::new();
        dash.scalar("a", 1.0, 1).unwrap();
        dash.scalar("b", 2.0, 1).unwrap();
        dash.scalar("a", 3.0, 2).unwrap();
        assert_eq!(dash.scalar_values("a"), vec![(1, 1.0), (2, 3.0)]);
    }
}
