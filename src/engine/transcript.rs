//! Transcript of visible commands and their output.
//!
//! Requests carry `show_command` / `show_output` flags; only the visible parts
//! reach the sink, and command text is redacted before it gets here.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptEntry {
    Command { host: String, command: String },
    Output { host: String, text: String },
}

pub trait Transcript: Send + Sync {
    fn record(&self, entry: TranscriptEntry);
}

/// Writes entries to the `transcript` tracing target.
#[derive(Debug, Default)]
pub struct TracingTranscript;

impl Transcript for TracingTranscript {
    fn record(&self, entry: TranscriptEntry) {
        match entry {
            TranscriptEntry::Command { host, command } => {
                info!(target: "transcript", host = %host, "$ {}", command);
            }
            TranscriptEntry::Output { host, text } => {
                info!(target: "transcript", host = %host, "{}", text.trim_end());
            }
        }
    }
}

/// Keeps entries in memory with their timestamps.
#[derive(Debug, Default)]
pub struct MemoryTranscript {
    entries: Mutex<Vec<(DateTime<Utc>, TranscriptEntry)>>,
}

impl MemoryTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// Concatenated output recorded for `host`.
    pub fn output_for(&self, host: &str) -> String {
        self.entries()
            .into_iter()
            .filter_map(|entry| match entry {
                TranscriptEntry::Output { host: h, text } if h == host => Some(text),
                _ => None,
            })
            .collect()
    }
}

impl Transcript for MemoryTranscript {
    fn record(&self, entry: TranscriptEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((Utc::now(), entry));
    }
}
