//! Log buffer service
//!
//! Manages in-memory log collection for job execution.
//! The buffer keeps only the most recent window of lines: once it holds
//! `capacity` entries, each new line evicts the oldest one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Default number of lines retained per job
pub const DEFAULT_LOG_CAPACITY: usize = 5000;

/// Service for managing log buffers
pub trait LogBufferService: Send + Sync {
    /// Appends a line to the buffer
    ///
    /// Lines appended after [`close`](Self::close) are dropped.
    fn push(&self, line: String);

    /// Returns a copy of the buffered lines, oldest first
    fn snapshot(&self) -> Vec<String>;

    /// Stops accepting new lines
    fn close(&self);

    /// Number of buffered lines
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct LogState {
    lines: VecDeque<String>,
    closed: bool,
}

/// Bounded in-memory implementation of LogBufferService
pub struct BoundedLogBuffer {
    capacity: usize,
    state: Mutex<LogState>,
}

impl BoundedLogBuffer {
    /// Creates a buffer retaining at most `capacity` lines
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LogState {
                lines: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl Default for BoundedLogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBufferService for BoundedLogBuffer {
    fn push(&self, line: String) {
        let mut state = self.state.lock().unwrap();
        if state.closed || self.capacity == 0 {
            return;
        }
        while state.lines.len() >= self.capacity {
            state.lines.pop_front();
        }
        state.lines.push_back(line);
    }

    fn snapshot(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.lines.iter().cloned().collect()
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }

    fn len(&self) -> usize {
        self.state.lock().unwrap().lines.len()
    }
}

/// Append-only line writer handed to a job's work function
///
/// This is the only channel through which job output reaches the job log.
#[derive(Clone)]
pub struct LogSink {
    buffer: Arc<dyn LogBufferService>,
}

impl LogSink {
    /// Creates a sink writing into `buffer`
    pub fn new(buffer: Arc<dyn LogBufferService>) -> Self {
        Self { buffer }
    }

    /// Appends a single line
    pub fn line(&self, line: impl Into<String>) {
        self.buffer.push(line.into());
    }

    /// Appends arbitrary text, one entry per line
    pub fn write_str(&self, text: &str) {
        for line in text.lines() {
            self.buffer.push(line.trim_end_matches('\r').to_string());
        }
    }

    /// Appends raw output bytes, replacing invalid UTF-8
    pub fn write_bytes(&self, bytes: &[u8]) {
        self.write_str(&String::from_utf8_lossy(bytes));
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("lines", &self.buffer.len())
            .finish()
    }
}
