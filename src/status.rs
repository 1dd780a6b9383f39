use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Lifecycle of one tracked image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    WaitingRetry,
    Success,
    Failed,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::WaitingRetry => "waiting-retry",
            ItemStatus::Success => "success",
            ItemStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Everything a front end needs to display one image's state.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub status: ItemStatus,
    pub caption: String,
    pub tags: String,
    /// Failure reason or embedding warning, human readable.
    pub note: String,
}

impl ImageRecord {
    fn pending(path: PathBuf) -> Self {
        Self {
            path,
            status: ItemStatus::Pending,
            caption: String::new(),
            tags: String::new(),
            note: String::new(),
        }
    }
}

/// Notifications any UI layer can subscribe to; the core never touches
/// presentation state directly.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    StatusChanged { path: PathBuf, status: ItemStatus },
    QueueChanged,
    Log(String),
}

/// Shared per-file status map, doubling as the dedup set.
///
/// A path enters the map when it is first enqueued and leaves only through
/// [`remove`](StatusTracker::remove) or [`clear`](StatusTracker::clear) —
/// never on success or failure. That is what blocks accidental re-enqueue of
/// an in-flight or completed file.
#[derive(Clone)]
pub struct StatusTracker {
    records: Arc<Mutex<HashMap<PathBuf, ImageRecord>>>,
    events: broadcast::Sender<QueueEvent>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.records.lock().unwrap().contains_key(path)
    }

    /// Create a pending record for a newly enqueued path. Returns `false`
    /// (and changes nothing) when the path is already tracked.
    pub fn insert_pending(&self, path: &Path) -> bool {
        {
            let mut records = self.records.lock().unwrap();
            if records.contains_key(path) {
                return false;
            }
            records.insert(path.to_path_buf(), ImageRecord::pending(path.to_path_buf()));
        }
        self.emit(QueueEvent::StatusChanged {
            path: path.to_path_buf(),
            status: ItemStatus::Pending,
        });
        true
    }

    /// Upsert the status of a record, e.g. resetting to pending on requeue or
    /// flagging waiting-retry between attempts.
    pub fn set_status(&self, path: &Path, status: ItemStatus) {
        {
            let mut records = self.records.lock().unwrap();
            let record = records
                .entry(path.to_path_buf())
                .or_insert_with(|| ImageRecord::pending(path.to_path_buf()));
            record.status = status;
        }
        self.emit(QueueEvent::StatusChanged {
            path: path.to_path_buf(),
            status,
        });
    }

    pub fn record_success(&self, path: &Path, caption: String, tags: String, note: String) {
        {
            let mut records = self.records.lock().unwrap();
            let record = records
                .entry(path.to_path_buf())
                .or_insert_with(|| ImageRecord::pending(path.to_path_buf()));
            record.status = ItemStatus::Success;
            record.caption = caption;
            record.tags = tags;
            record.note = note;
        }
        self.emit(QueueEvent::StatusChanged {
            path: path.to_path_buf(),
            status: ItemStatus::Success,
        });
    }

    pub fn record_failure(&self, path: &Path, note: String) {
        {
            let mut records = self.records.lock().unwrap();
            let record = records
                .entry(path.to_path_buf())
                .or_insert_with(|| ImageRecord::pending(path.to_path_buf()));
            record.status = ItemStatus::Failed;
            record.note = note;
        }
        self.emit(QueueEvent::StatusChanged {
            path: path.to_path_buf(),
            status: ItemStatus::Failed,
        });
    }

    pub fn get(&self, path: &Path) -> Option<ImageRecord> {
        self.records.lock().unwrap().get(path).cloned()
    }

    /// Drop a record (and with it the dedup entry), allowing the path to be
    /// enqueued again later.
    pub fn remove(&self, path: &Path) -> Option<ImageRecord> {
        let removed = self.records.lock().unwrap().remove(path);
        if removed.is_some() {
            self.emit(QueueEvent::QueueChanged);
        }
        removed
    }

    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
        self.emit(QueueEvent::QueueChanged);
    }

    pub fn snapshot(&self) -> Vec<ImageRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    /// Emit a human-readable log line to subscribers.
    pub fn log(&self, message: impl Into<String>) {
        self.emit(QueueEvent::Log(message.into()));
    }

    pub fn queue_changed(&self) {
        self.emit(QueueEvent::QueueChanged);
    }

    fn emit(&self, event: QueueEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}
