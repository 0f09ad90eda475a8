//! Bounded in-memory log of structured server events.
//!
//! Every connection failure, dropped fan-out branch, and captured stderr line
//! lands here so operators can inspect back-end behavior without scraping
//! process output. The ring keeps the newest `max_entries` events; registered
//! listeners receive a copy of each event as it is recorded.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

const DEFAULT_MAX_ENTRIES: usize = 1000;
const LISTENER_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A single structured event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub server_name: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LogEntry {
    fn new(server_name: &str, level: LogLevel, message: String, error: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            server_name: server_name.to_string(),
            level,
            message,
            error,
        }
    }
}

/// Thread-safe bounded event ring with listener fan-out.
pub struct LogStore {
    entries: RwLock<VecDeque<LogEntry>>,
    max_entries: usize,
    listeners: Mutex<Vec<mpsc::Sender<LogEntry>>>,
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_entries.min(1024))),
            max_entries: max_entries.max(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Record an event, evicting the oldest entry once the ring is full.
    pub fn add(&self, server_name: &str, level: LogLevel, message: impl Into<String>) {
        self.add_with_error(server_name, level, message, None::<String>);
    }

    pub fn add_with_error(
        &self,
        server_name: &str,
        level: LogLevel,
        message: impl Into<String>,
        error: Option<impl ToString>,
    ) {
        let entry = LogEntry::new(
            server_name,
            level,
            message.into(),
            error.map(|e| e.to_string()),
        );

        {
            let mut entries = self.entries.write();
            if entries.len() >= self.max_entries {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        // Dead listeners are pruned as they are discovered; a full listener
        // drops this event rather than blocking the caller.
        let mut listeners = self.listeners.lock();
        listeners.retain(|tx| match tx.try_send(entry.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Register a listener that receives every subsequent event.
    pub fn subscribe(&self) -> mpsc::Receiver<LogEntry> {
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        self.listeners.lock().push(tx);
        rx
    }

    /// Newest-first slice of recent entries.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.entries.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_recent() {
        let store = LogStore::new();
        store.add("alpha", LogLevel::Info, "connected");
        store.add_with_error("beta", LogLevel::Error, "connect failed", Some("boom"));

        assert_eq!(store.len(), 2);
        let recent = store.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].server_name, "beta");
        assert_eq!(recent[0].level, LogLevel::Error);
        assert_eq!(recent[0].error.as_deref(), Some("boom"));
        assert_eq!(recent[1].server_name, "alpha");
    }

    #[test]
    fn test_ring_eviction() {
        let store = LogStore::with_capacity(5);
        for i in 0..10 {
            store.add("s", LogLevel::Info, format!("event-{i}"));
        }

        assert_eq!(store.len(), 5);
        let recent = store.recent(10);
        assert_eq!(recent[0].message, "event-9");
        assert_eq!(recent[4].message, "event-5");
    }

    #[tokio::test]
    async fn test_listener_receives_events() {
        let store = LogStore::new();
        let mut rx = store.subscribe();

        store.add("alpha", LogLevel::Warn, "slow response");

        let entry = rx.recv().await.expect("listener should receive the event");
        assert_eq!(entry.server_name, "alpha");
        assert_eq!(entry.level, LogLevel::Warn);
    }

    #[test]
    fn test_closed_listener_pruned() {
        let store = LogStore::new();
        let rx = store.subscribe();
        drop(rx);

        store.add("alpha", LogLevel::Info, "first");
        store.add("alpha", LogLevel::Info, "second");

        assert!(store.listeners.lock().is_empty());
    }
}
