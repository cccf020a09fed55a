//! Diagnostics bus
//!
//! Bounded, append-only, multi-subscriber event log shared by every link
//! component. Decoupled from any presentation layer: screens, exporters and
//! tests all consume the same feed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Severity of a diagnostic entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Verbose wire-level detail
    Debug,
    /// Normal lifecycle events
    Info,
    /// Degraded but recoverable conditions
    Warn,
    /// Failures surfaced to the caller
    Error,
}

/// A single structured diagnostics entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagEntry {
    /// When the entry was published
    pub timestamp: DateTime<Utc>,
    /// Entry severity
    pub severity: Severity,
    /// Component that produced the entry (e.g. "codec", "prober")
    pub source: String,
    /// Human-readable message
    pub message: String,
}

struct Inner {
    entries: Mutex<VecDeque<DiagEntry>>,
    capacity: usize,
    feed: broadcast::Sender<DiagEntry>,
}

/// Shared diagnostics bus handle.
///
/// Cloning is cheap; all clones publish into the same bounded ring. Writers
/// never block: when the ring is full the oldest entry is dropped, and live
/// subscribers that lag simply miss entries.
#[derive(Clone)]
pub struct DiagBus {
    inner: Arc<Inner>,
}

impl DiagBus {
    /// Create a bus retaining at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(16));
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity: capacity.max(1),
                feed,
            }),
        }
    }

    /// Append an entry, dropping the oldest if the ring is full.
    pub fn publish(&self, severity: Severity, source: &str, message: impl Into<String>) {
        let entry = DiagEntry {
            timestamp: Utc::now(),
            severity,
            source: source.to_string(),
            message: message.into(),
        };

        {
            let mut entries = self.inner.entries.lock().expect("diag ring poisoned");
            if entries.len() >= self.inner.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        // No live subscribers is fine; the ring still retains the entry.
        let _ = self.inner.feed.send(entry);
    }

    /// Shorthand for [`Severity::Debug`] entries.
    pub fn debug(&self, source: &str, message: impl Into<String>) {
        self.publish(Severity::Debug, source, message);
    }

    /// Shorthand for [`Severity::Info`] entries.
    pub fn info(&self, source: &str, message: impl Into<String>) {
        self.publish(Severity::Info, source, message);
    }

    /// Shorthand for [`Severity::Warn`] entries.
    pub fn warn(&self, source: &str, message: impl Into<String>) {
        self.publish(Severity::Warn, source, message);
    }

    /// Shorthand for [`Severity::Error`] entries.
    pub fn error(&self, source: &str, message: impl Into<String>) {
        self.publish(Severity::Error, source, message);
    }

    /// Subscribe to entries published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<DiagEntry> {
        self.inner.feed.subscribe()
    }

    /// Copy of the currently retained entries, oldest first.
    pub fn snapshot(&self) -> Vec<DiagEntry> {
        self.inner
            .entries
            .lock()
            .expect("diag ring poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Number of currently retained entries.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().expect("diag ring poisoned").len()
    }

    /// True when no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Export the retained entries as a JSON array (for log export screens).
    pub fn export_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.snapshot())
    }
}

impl std::fmt::Debug for DiagBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagBus")
            .field("capacity", &self.inner.capacity)
            .field("len", &self.len())
            .finish()
    }
}
