use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Which pipe of the supervised process a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogStream::Stdout => f.write_str("stdout"),
            LogStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// One captured output line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub line: String,
}

impl LogLine {
    pub fn new(stream: LogStream, line: String) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            line,
        }
    }
}

/// Ring buffer of recent process output
pub struct ProcessLogBuffer {
    entries: VecDeque<LogLine>,
    capacity: usize,
    broadcast_tx: broadcast::Sender<LogLine>,
}

impl ProcessLogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (broadcast_tx, _) = broadcast::channel(256);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            broadcast_tx,
        }
    }

    /// Append a line, evicting the oldest one when full
    pub fn push(&mut self, entry: LogLine) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.clone());

        // Broadcast to followers (ignore errors if nobody is following)
        let _ = self.broadcast_tx.send(entry);
    }

    /// Follow new lines as they arrive
    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.broadcast_tx.subscribe()
    }

    /// All lines, oldest first
    pub fn lines(&self) -> Vec<LogLine> {
        self.entries.iter().cloned().collect()
    }

    /// The last `n` lines, oldest first
    pub fn tail(&self, n: usize) -> Vec<LogLine> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Lines filtered by stream and keyword, oldest first
    pub fn get_filtered(&self, stream: Option<LogStream>, keyword: Option<&str>) -> Vec<LogLine> {
        self.entries
            .iter()
            .filter(|entry| stream.map_or(true, |s| entry.stream == s))
            .filter(|entry| keyword.map_or(true, |kw| entry.line.contains(kw)))
            .cloned()
            .collect()
    }

    /// Captured output joined into one block, used as an error message.
    pub fn joined(&self) -> String {
        self.entries
            .iter()
            .map(|e| e.line.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Thread-safe wrapper shared between the reader tasks and callers
pub type SharedLogBuffer = Arc<Mutex<ProcessLogBuffer>>;

pub fn create_log_buffer(capacity: usize) -> SharedLogBuffer {
    Arc::new(Mutex::new(ProcessLogBuffer::new(capacity)))
}
