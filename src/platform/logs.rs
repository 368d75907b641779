//! Per-application bounded log buffers.
//!
//! Every supervised process and every deploy writes into the owning app's
//! ring buffer. Lines carry a per-app monotonically increasing `seq` so
//! clients can tail incrementally with [`LogAggregator::since`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::models::{LogLine, LogStream};
use super::ws::{PlatformEvent, broadcast_message};

struct LogBuffer {
    lines: VecDeque<LogLine>,
    next_seq: u64,
}

impl LogBuffer {
    fn new() -> Self {
        Self {
            lines: VecDeque::new(),
            next_seq: 1,
        }
    }
}

/// Ring buffers keyed by app name.
pub struct LogAggregator {
    capacity: usize,
    buffers: DashMap<String, Arc<Mutex<LogBuffer>>>,
    ws_tx: broadcast::Sender<String>,
}

impl LogAggregator {
    pub fn new(capacity: usize, ws_tx: broadcast::Sender<String>) -> Self {
        Self {
            capacity,
            buffers: DashMap::new(),
            ws_tx,
        }
    }

    fn buffer(&self, app: &str) -> Arc<Mutex<LogBuffer>> {
        self.buffers
            .entry(app.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LogBuffer::new())))
            .clone()
    }

    /// Append one line, evicting the oldest when full, and publish it.
    pub fn append(&self, app: &str, stream: LogStream, text: impl Into<String>) -> LogLine {
        let buffer = self.buffer(app);
        let line = {
            let mut buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
            let line = LogLine {
                seq: buf.next_seq,
                timestamp: chrono::Utc::now().to_rfc3339(),
                stream,
                text: text.into(),
            };
            buf.next_seq += 1;
            if self.capacity > 0 {
                while buf.lines.len() >= self.capacity {
                    buf.lines.pop_front();
                }
                buf.lines.push_back(line.clone());
            }
            line
        };
        broadcast_message(
            &self.ws_tx,
            &PlatformEvent::LogLine {
                name: app.to_string(),
                line: line.clone(),
            },
        );
        line
    }

    /// The most recent `n` lines, oldest first.
    pub fn tail(&self, app: &str, n: usize) -> Vec<LogLine> {
        let Some(buffer) = self.buffers.get(app).map(|b| b.clone()) else {
            return Vec::new();
        };
        let buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
        let skip = buf.lines.len().saturating_sub(n);
        buf.lines.iter().skip(skip).cloned().collect()
    }

    /// Lines with `seq > after`, oldest first.
    pub fn since(&self, app: &str, after: u64) -> Vec<LogLine> {
        let Some(buffer) = self.buffers.get(app).map(|b| b.clone()) else {
            return Vec::new();
        };
        let buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
        buf.lines.iter().filter(|l| l.seq > after).cloned().collect()
    }

    /// Sequence number the next appended line will get.
    pub fn next_seq(&self, app: &str) -> u64 {
        self.buffers
            .get(app)
            .map(|b| b.lock().unwrap_or_else(|e| e.into_inner()).next_seq)
            .unwrap_or(1)
    }

    pub fn remove(&self, app: &str) {
        self.buffers.remove(app);
    }

    /// Spawn a task that copies `reader` into the buffer line by line until EOF.
    pub fn capture<R>(self: &Arc<Self>, app: &str, stream: LogStream, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let logs = Arc::clone(self);
        let app = app.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        logs.append(&app, stream, line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(app = %app, error = %e, "log capture ended");
                        break;
                    }
                }
            }
        })
    }
}

/// Join lines into the plain-text form used by the `logs` field of API responses.
pub fn join_lines(lines: &[LogLine]) -> String {
    lines
        .iter()
        .map(|l| l.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
