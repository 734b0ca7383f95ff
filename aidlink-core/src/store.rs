//! Durable JSON-array stores: the retention-pruned message log and the
//! unpruned operational event log. Each store keeps its table in memory and
//! hands file rewrites to a background writer thread, so append paths never
//! touch the disk. Corrupt or absent files read as empty.

use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard};
use std::thread;

use crate::model::{now_ms, ConnectionEvent, EventType, Message};

/// Messages older than this are purged on the next store access.
pub const RETENTION_MS: i64 = 48 * 60 * 60 * 1000;

enum WriterCmd<T> {
    Persist(Vec<T>),
    Flush(mpsc::Sender<()>),
}

/// Append-only message log with lazy retention pruning. Reads prune the
/// in-memory table and queue a compacting rewrite whenever anything aged
/// out, so a periodic `read_all` keeps the file bounded even while nobody
/// is looking at it.
pub struct MessageStore {
    items: Mutex<Vec<Message>>,
    writer: mpsc::Sender<WriterCmd<Message>>,
}

impl MessageStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let items = load_array::<Message>(&path);
        Self {
            items: Mutex::new(items),
            writer: spawn_writer(path),
        }
    }

    /// Retained messages in insertion order. Queues a compacting rewrite
    /// when any entry aged past the retention window.
    pub fn read_all(&self) -> Vec<Message> {
        let mut items = hold(&self.items);
        let before = items.len();
        let now = now_ms();
        items.retain(|m| now - m.timestamp <= RETENTION_MS);
        if items.len() != before {
            let _ = self.writer.send(WriterCmd::Persist(items.clone()));
        }
        items.clone()
    }

    /// Append one message; the retained table is persisted off-thread.
    pub fn append(&self, message: Message) {
        let mut items = hold(&self.items);
        let now = now_ms();
        items.retain(|m| now - m.timestamp <= RETENTION_MS);
        items.push(message);
        let _ = self.writer.send(WriterCmd::Persist(items.clone()));
    }

    /// Block until every queued rewrite reached the disk.
    pub fn flush(&self) {
        flush_writer(&self.writer);
    }
}

/// Append-only operational audit log. Same writer discipline as the message
/// store, but never pruned.
pub struct EventLog {
    items: Mutex<Vec<ConnectionEvent>>,
    writer: mpsc::Sender<WriterCmd<ConnectionEvent>>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let items = load_array::<ConnectionEvent>(&path);
        Self {
            items: Mutex::new(items),
            writer: spawn_writer(path),
        }
    }

    pub fn read_all(&self) -> Vec<ConnectionEvent> {
        hold(&self.items).clone()
    }

    pub fn append(&self, event: ConnectionEvent) {
        let mut items = hold(&self.items);
        items.push(event);
        let _ = self.writer.send(WriterCmd::Persist(items.clone()));
    }

    /// Append a freshly timestamped event and mirror it to the trace output.
    pub fn log(&self, event_type: EventType, message: impl Into<String>) {
        let event = ConnectionEvent::new(event_type, message);
        tracing::debug!("[{:?}] {}", event.event_type, event.message);
        self.append(event);
    }

    /// Block until every queued rewrite reached the disk.
    pub fn flush(&self) {
        flush_writer(&self.writer);
    }
}

fn hold<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One writer thread per store owns the file. It applies snapshots in the
/// order they were queued and exits when the store is dropped.
fn spawn_writer<T>(path: PathBuf) -> mpsc::Sender<WriterCmd<T>>
where
    T: serde::Serialize + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<WriterCmd<T>>();
    thread::spawn(move || {
        for cmd in rx {
            match cmd {
                WriterCmd::Persist(items) => write_array(&path, &items),
                WriterCmd::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    });
    tx
}

fn flush_writer<T>(writer: &mpsc::Sender<WriterCmd<T>>) {
    let (ack_tx, ack_rx) = mpsc::channel();
    if writer.send(WriterCmd::Flush(ack_tx)).is_ok() {
        let _ = ack_rx.recv();
    }
}

fn load_array<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Vec<T> {
    match fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text).unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn write_array<T: serde::Serialize>(path: &PathBuf, items: &[T]) {
    match serde_json::to_vec(items) {
        Ok(bytes) => {
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            if let Err(e) = fs::write(path, bytes) {
                tracing::warn!("failed to persist {}: {e}", path.display());
            }
        }
        Err(e) => tracing::warn!("failed to serialize {}: {e}", path.display()),
    }
}
