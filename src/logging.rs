use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A single structured log event, as read back through the control plane's
/// `getLogs`/`clearLogs` operations. Storage and display belong to the UI
/// collaborator; this crate only emits records and keeps a short ring buffer
/// so the control API has something to serve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogRecord {
    /// Milliseconds since the Unix epoch.
    pub timestamp_millis: u128,
    pub level: String,
    pub target: String,
    pub message: String,
}

const RING_CAPACITY: usize = 1000;

/// Bounded in-memory log history backing `getLogs`/`clearLogs`.
#[derive(Debug, Default)]
pub struct LogRing {
    records: Mutex<VecDeque<LogRecord>>,
}

impl LogRing {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
        }
    }

    fn push(&self, record: LogRecord) {
        let mut records = self.records.lock().unwrap();
        if records.len() == RING_CAPACITY {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Records with `timestamp_millis >= since`, oldest first.
    pub fn since(&self, since: u128) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.timestamp_millis >= since)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

/// A `tracing_subscriber::Layer` that mirrors every event into a [`LogRing`],
/// alongside whatever file/stdout layers `main` installs.
pub struct RingLayer {
    ring: std::sync::Arc<LogRing>,
}

impl RingLayer {
    pub fn new(ring: std::sync::Arc<LogRing>) -> Self {
        Self { ring }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for RingLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let timestamp_millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        self.ring.push(LogRecord {
            timestamp_millis,
            level: level_string(*event.metadata().level()),
            target: event.metadata().target().to_owned(),
            message: visitor.message,
        });
    }
}

fn level_string(level: Level) -> String {
    match level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => "INFO",
        Level::WARN => "WARN",
        Level::ERROR => "ERROR",
    }
    .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: u128, msg: &str) -> LogRecord {
        LogRecord {
            timestamp_millis: ts,
            level: "INFO".to_owned(),
            target: "test".to_owned(),
            message: msg.to_owned(),
        }
    }

    #[test]
    fn since_filters_and_preserves_order() {
        let ring = LogRing::new();
        ring.push(record(1, "a"));
        ring.push(record(2, "b"));
        ring.push(record(3, "c"));

        let recent = ring.since(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "b");
        assert_eq!(recent[1].message, "c");
    }

    #[test]
    fn clear_empties_ring() {
        let ring = LogRing::new();
        ring.push(record(1, "a"));
        ring.clear();
        assert!(ring.since(0).is_empty());
    }

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let ring = LogRing::new();
        for i in 0..(RING_CAPACITY + 10) {
            ring.push(record(i as u128, "x"));
        }
        let all = ring.since(0);
        assert_eq!(all.len(), RING_CAPACITY);
        assert_eq!(all[0].timestamp_millis, 10);
    }
}
