//! Durable per-thread event logs.
//!
//! Every published event is appended to its thread's log under a strictly
//! increasing message id. Logs are capped at a maximum length (oldest
//! entries trimmed) and expire after a period without appends.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use grav_core::{storage_key, StreamEvent};

use crate::error::{StreamError, StreamResult};

/// An event stored in a thread log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggedEvent {
    pub message_id: u64,
    pub event: StreamEvent,
}

/// An event as delivered to a subscriber.
///
/// `message_id` is absent only when the log was unavailable at publish
/// time. `historical` marks events replayed from before the subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,
    #[serde(default)]
    pub historical: bool,
    #[serde(flatten)]
    pub event: StreamEvent,
}

impl EventFrame {
    pub fn live(message_id: Option<u64>, event: StreamEvent) -> Self {
        Self {
            message_id,
            historical: false,
            event,
        }
    }

    pub fn from_logged(logged: LoggedEvent, historical: bool) -> Self {
        Self {
            message_id: Some(logged.message_id),
            historical,
            event: logged.event,
        }
    }
}

/// Append-only, bounded, expiring event storage keyed by thread.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event and return its message id.
    async fn append(&self, event: &StreamEvent) -> StreamResult<u64>;

    /// Retained events with ids greater than `after`, oldest first.
    async fn read_after(&self, thread_id: &str, after: Option<u64>) -> StreamResult<Vec<LoggedEvent>>;

    /// Drop a thread's log, returning how many events were removed.
    async fn delete(&self, thread_id: &str) -> StreamResult<usize>;

    /// Number of retained events for a thread.
    async fn len(&self, thread_id: &str) -> StreamResult<usize>;
}

fn after_filter(after: Option<u64>) -> impl Fn(&LoggedEvent) -> bool {
    move |entry| after.map_or(true, |last| entry.message_id > last)
}

#[derive(Debug)]
struct MemoryLog {
    next_id: u64,
    entries: VecDeque<LoggedEvent>,
    touched: Instant,
}

#[derive(Debug)]
struct MemoryLogs {
    by_thread: HashMap<String, MemoryLog>,
    /// Lowest id a recreated log may start from; above every id handed
    /// out by a log that has been pruned.
    floor: u64,
    swept: Instant,
}

/// Event log held in process memory.
///
/// Expired logs are pruned from the map. A log created later for the same
/// thread continues above every id issued before, so client offsets from
/// the old log never hide new events.
#[derive(Debug)]
pub struct InMemoryEventLog {
    max_len: usize,
    ttl: Duration,
    logs: Mutex<MemoryLogs>,
}

impl InMemoryEventLog {
    pub fn new(max_len: usize, ttl: Duration) -> Self {
        Self {
            max_len: max_len.max(1),
            ttl,
            logs: Mutex::new(MemoryLogs {
                by_thread: HashMap::new(),
                floor: 1,
                swept: Instant::now(),
            }),
        }
    }

    fn expire(&self, log: &mut MemoryLog) {
        if log.touched.elapsed() > self.ttl && !log.entries.is_empty() {
            debug!("Event log expired with {} entries", log.entries.len());
            log.entries = VecDeque::new();
        }
    }

    /// Drop expired logs other than `keep`, at most once per TTL period.
    fn sweep(&self, logs: &mut MemoryLogs, keep: &str) {
        if logs.swept.elapsed() <= self.ttl {
            return;
        }
        logs.swept = Instant::now();
        let ttl = self.ttl;
        let mut floor = logs.floor;
        logs.by_thread.retain(|thread_id, log| {
            let live = thread_id == keep || log.touched.elapsed() <= ttl;
            if !live {
                floor = floor.max(log.next_id);
            }
            live
        });
        logs.floor = floor;
    }

    /// Number of threads with a log in memory, expired or not.
    pub fn thread_count(&self) -> usize {
        self.logs.lock().by_thread.len()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: &StreamEvent) -> StreamResult<u64> {
        let mut logs = self.logs.lock();
        self.sweep(&mut logs, &event.thread_id);
        let floor = logs.floor;
        let log = logs
            .by_thread
            .entry(event.thread_id.clone())
            .or_insert_with(|| MemoryLog {
                next_id: floor,
                entries: VecDeque::new(),
                touched: Instant::now(),
            });
        self.expire(log);

        let message_id = log.next_id;
        log.next_id += 1;
        log.entries.push_back(LoggedEvent {
            message_id,
            event: event.clone(),
        });
        while log.entries.len() > self.max_len {
            log.entries.pop_front();
        }
        log.touched = Instant::now();
        Ok(message_id)
    }

    async fn read_after(&self, thread_id: &str, after: Option<u64>) -> StreamResult<Vec<LoggedEvent>> {
        let mut logs = self.logs.lock();
        let Some(log) = logs.by_thread.get_mut(thread_id) else {
            return Ok(Vec::new());
        };
        self.expire(log);
        let keep = after_filter(after);
        Ok(log
            .entries
            .iter()
            .filter(|entry| keep(entry))
            .cloned()
            .collect())
    }

    async fn delete(&self, thread_id: &str) -> StreamResult<usize> {
        let mut logs = self.logs.lock();
        match logs.by_thread.remove(thread_id) {
            Some(log) => {
                logs.floor = logs.floor.max(log.next_id);
                Ok(log.entries.len())
            }
            None => Ok(0),
        }
    }

    async fn len(&self, thread_id: &str) -> StreamResult<usize> {
        let mut logs = self.logs.lock();
        Ok(match logs.by_thread.get_mut(thread_id) {
            Some(log) => {
                self.expire(log);
                log.entries.len()
            }
            None => 0,
        })
    }
}

#[derive(Debug)]
struct FileState {
    next_id: u64,
    lines: usize,
}

/// Event log stored as one JSON-lines file per thread.
///
/// Files live at `<data_dir>/streams/<storage key>.jsonl`. A file grows past
/// the length cap by a quarter before it is compacted, and reads only ever
/// return the newest `max_len` entries. Expiry uses the file's modification
/// time, so logs survive restarts until their TTL runs out.
#[derive(Debug)]
pub struct FileEventLog {
    root: PathBuf,
    max_len: usize,
    ttl: Duration,
    state: Mutex<HashMap<String, FileState>>,
}

impl FileEventLog {
    pub fn open(data_dir: &Path, max_len: usize, ttl: Duration) -> StreamResult<Self> {
        let root = data_dir.join("streams");
        fs::create_dir_all(&root).map_err(|e| {
            StreamError::Unavailable(format!("cannot create {}: {}", root.display(), e))
        })?;
        Ok(Self {
            root,
            max_len: max_len.max(1),
            ttl,
            state: Mutex::new(HashMap::new()),
        })
    }

    fn path(&self, thread_id: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", storage_key(thread_id)))
    }

    /// Sidecar holding the next id of a thread whose log expired.
    fn high_water_path(&self, thread_id: &str) -> PathBuf {
        self.root.join(format!("{}.next", storage_key(thread_id)))
    }

    fn read_high_water(path: &Path) -> u64 {
        fs::read_to_string(path)
            .ok()
            .and_then(|text| text.trim().parse().ok())
            .unwrap_or(1)
    }

    fn read_file(path: &Path) -> StreamResult<Vec<LoggedEvent>> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LoggedEvent>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping corrupt event log line in {}: {}", path.display(), e),
            }
        }
        Ok(entries)
    }

    fn is_expired(&self, path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map_or(false, |age| age > self.ttl)
    }

    /// Load state for a thread, dropping the file first if it has expired.
    fn state_for<'a>(
        &self,
        states: &'a mut HashMap<String, FileState>,
        thread_id: &str,
    ) -> StreamResult<&'a mut FileState> {
        let path = self.path(thread_id);
        let high_water = self.high_water_path(thread_id);
        if self.is_expired(&path) {
            debug!("Event log for thread {} expired", thread_id);
            let next_id = Self::read_file(&path)?
                .last()
                .map_or(1, |entry| entry.message_id + 1)
                .max(states.get(thread_id).map_or(1, |state| state.next_id))
                .max(Self::read_high_water(&high_water));
            fs::write(&high_water, next_id.to_string())?;
            fs::remove_file(&path)?;
            if let Some(state) = states.get_mut(thread_id) {
                state.lines = 0;
            }
        }
        if !states.contains_key(thread_id) {
            let entries = Self::read_file(&path)?;
            let next_id = entries
                .last()
                .map_or(1, |entry| entry.message_id + 1)
                .max(Self::read_high_water(&high_water));
            states.insert(
                thread_id.to_string(),
                FileState {
                    next_id,
                    lines: entries.len(),
                },
            );
        }
        states
            .get_mut(thread_id)
            .ok_or_else(|| StreamError::Unavailable("event log state missing".to_string()))
    }

    fn compact(&self, path: &Path) -> StreamResult<usize> {
        let entries = Self::read_file(path)?;
        let keep = &entries[entries.len().saturating_sub(self.max_len)..];
        let tmp = path.with_extension("jsonl.tmp");
        let mut out = fs::File::create(&tmp)?;
        for entry in keep {
            writeln!(out, "{}", serde_json::to_string(entry)?)?;
        }
        out.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(keep.len())
    }
}

#[async_trait]
impl EventLog for FileEventLog {
    async fn append(&self, event: &StreamEvent) -> StreamResult<u64> {
        let mut states = self.state.lock();
        let path = self.path(&event.thread_id);
        let cap = self.max_len + self.max_len / 4;
        let state = self.state_for(&mut states, &event.thread_id)?;

        let message_id = state.next_id;
        let line = serde_json::to_string(&LoggedEvent {
            message_id,
            event: event.clone(),
        })?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", line)?;
        state.next_id += 1;
        state.lines += 1;

        if state.lines > cap {
            state.lines = self.compact(&path)?;
        }
        Ok(message_id)
    }

    async fn read_after(&self, thread_id: &str, after: Option<u64>) -> StreamResult<Vec<LoggedEvent>> {
        let mut states = self.state.lock();
        self.state_for(&mut states, thread_id)?;
        let entries = Self::read_file(&self.path(thread_id))?;
        let start = entries.len().saturating_sub(self.max_len);
        Ok(entries
            .into_iter()
            .skip(start)
            .filter(after_filter(after))
            .collect())
    }

    async fn delete(&self, thread_id: &str) -> StreamResult<usize> {
        let mut states = self.state.lock();
        let path = self.path(thread_id);
        let removed = Self::read_file(&path)?.len().min(self.max_len);
        states.remove(thread_id);
        match fs::remove_file(self.high_water_path(thread_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(removed),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn len(&self, thread_id: &str) -> StreamResult<usize> {
        let mut states = self.state.lock();
        let state = self.state_for(&mut states, thread_id)?;
        Ok(state.lines.min(self.max_len))
    }
}
