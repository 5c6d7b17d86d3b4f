//! Live fan-out of frames to subscribers.
//!
//! Each thread gets a broadcast channel created on first subscription.
//! Pattern subscribers match against event channel names such as
//! `workflow:t1:generate:token` using `*` wildcards.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::{StreamError, StreamResult};
use crate::log::EventFrame;

/// Translate a `*` wildcard channel pattern into an anchored regex.
pub fn pattern_regex(pattern: &str) -> StreamResult<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body)).map_err(|e| StreamError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

struct PatternEntry {
    regex: Regex,
    tx: mpsc::Sender<Arc<EventFrame>>,
}

/// Receiver side of a pattern subscription.
pub struct PatternSubscription {
    pattern: String,
    rx: mpsc::Receiver<Arc<EventFrame>>,
}

impl PatternSubscription {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next matching frame, or `None` once the registry is gone.
    pub async fn recv(&mut self) -> Option<EventFrame> {
        self.rx.recv().await.map(|frame| (*frame).clone())
    }
}

/// Registry of live subscribers.
pub struct SubscriberRegistry {
    capacity: usize,
    threads: Mutex<HashMap<String, broadcast::Sender<Arc<EventFrame>>>>,
    patterns: Mutex<Vec<PatternEntry>>,
}

impl SubscriberRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            threads: Mutex::new(HashMap::new()),
            patterns: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to every live frame of a thread.
    pub fn subscribe(&self, thread_id: &str) -> broadcast::Receiver<Arc<EventFrame>> {
        let mut threads = self.threads.lock();
        // Channels whose subscribers all left before any broadcast
        threads.retain(|id, tx| id == thread_id || tx.receiver_count() > 0);
        threads
            .entry(thread_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to frames whose channel name matches a wildcard pattern.
    pub fn psubscribe(&self, pattern: &str) -> StreamResult<PatternSubscription> {
        let regex = pattern_regex(pattern)?;
        let (tx, rx) = mpsc::channel(self.capacity);
        self.patterns.lock().push(PatternEntry { regex, tx });
        debug!("Pattern subscription added: {}", pattern);
        Ok(PatternSubscription {
            pattern: pattern.to_string(),
            rx,
        })
    }

    /// Deliver a frame to thread subscribers, and to pattern subscribers
    /// when `include_patterns` is set.
    pub fn broadcast(&self, frame: EventFrame, include_patterns: bool) {
        let frame = Arc::new(frame);
        let thread_id = frame.event.thread_id.clone();
        {
            let mut threads = self.threads.lock();
            if let Some(tx) = threads.get(&thread_id) {
                if tx.send(frame.clone()).is_err() {
                    // Nobody listening any more
                    threads.remove(&thread_id);
                }
            }
        }

        if include_patterns {
            let channel = frame.event.channel();
            let mut patterns = self.patterns.lock();
            patterns.retain(|entry| !entry.tx.is_closed());
            for entry in patterns.iter().filter(|entry| entry.regex.is_match(&channel)) {
                if entry.tx.try_send(frame.clone()).is_err() {
                    warn!("Pattern subscriber is full; dropping event on {}", channel);
                }
            }
        }
    }

    /// Close a thread's channel, ending its live subscriptions.
    pub fn close(&self, thread_id: &str) -> bool {
        self.threads.lock().remove(thread_id).is_some()
    }

    /// Number of threads with live subscribers.
    pub fn thread_count(&self) -> usize {
        self.threads
            .lock()
            .values()
            .filter(|tx| tx.receiver_count() > 0)
            .count()
    }

    /// Number of thread channels held, including idle ones.
    pub fn channel_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn pattern_count(&self) -> usize {
        let mut patterns = self.patterns.lock();
        patterns.retain(|entry| !entry.tx.is_closed());
        patterns.len()
    }
}
