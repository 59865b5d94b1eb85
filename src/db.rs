//! Message store backends.
//!
//! A [`MessageStoreDb`] appends envelopes to an ordered log, stamping each
//! with its per-stream `version`, per-channel `channel_version`, and
//! per-trace `depth`, and answers the read queries the
//! [`MessageStore`](crate::MessageStore) needs. Two backends ship with the
//! crate:
//!
//! - [`InMemoryMessageStoreDb`]: a vector plus counter maps, lost on drop.
//! - [`JsonlMessageStoreDb`]: the same index, backed by an `eventfold`
//!   append-only JSONL log with one event per [`StoredMessage`].

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use eventfold::{Event, EventReader, EventWriter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::dispatcher::{DispatcherSubscription, matches_subscriptions};
use crate::error::StoreError;
use crate::message::{
    Channel, Envelope, Message, MessageId, StoredMessage, StreamName, TraceId, new_message_id,
};

/// Ordering metadata assigned to a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogResult {
    /// Assigned message id.
    pub id: MessageId,
    /// Position within the instance stream, starting at 1.
    pub version: u64,
    /// Position within the channel, starting at 1.
    pub channel_version: u64,
    /// Position within the trace, starting at 0.
    pub depth: u64,
}

impl From<&StoredMessage> for LogResult {
    fn from(message: &StoredMessage) -> Self {
        Self {
            id: message.id,
            version: message.version,
            channel_version: message.channel_version,
            depth: message.depth,
        }
    }
}

/// Storage backend behind a [`MessageStore`](crate::MessageStore).
///
/// Implementations must stamp and append atomically with respect to
/// concurrent `log_message` calls, and return every query result in log
/// order.
#[async_trait]
pub trait MessageStoreDb: Send + Sync + 'static {
    /// Stamp `envelope` with ordering metadata and append it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if persisting fails; counters are not advanced.
    async fn log_message(&self, envelope: Envelope) -> Result<StoredMessage, StoreError>;

    /// All messages of one trace.
    async fn get_trace(&self, trace_id: TraceId) -> Result<Vec<StoredMessage>, StoreError>;

    /// Messages on a subscribed channel past that subscription's offset.
    async fn get_dispatcher_stream(
        &self,
        subscriptions: &[DispatcherSubscription],
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// All messages for instance `id` across `channels`.
    async fn get_aggregate_stream(
        &self,
        channels: &[Channel],
        id: &str,
    ) -> Result<Vec<StoredMessage>, StoreError>;
}

/// In-memory log with counter indexes. Queries are linear scans.
#[derive(Debug, Default)]
pub(crate) struct MessageLog {
    messages: Vec<StoredMessage>,
    stream_versions: HashMap<StreamName, u64>,
    channel_versions: HashMap<Channel, u64>,
    trace_depths: HashMap<TraceId, u64>,
}

impl MessageLog {
    /// Build the stored form `envelope` would get if appended now.
    fn stamp(&self, envelope: Envelope) -> StoredMessage {
        let version = self
            .stream_versions
            .get(&envelope.stream_name)
            .copied()
            .unwrap_or(0)
            + 1;
        let channel_version = self
            .channel_versions
            .get(&envelope.stream_name.channel())
            .copied()
            .unwrap_or(0)
            + 1;
        let depth = self
            .trace_depths
            .get(&envelope.trace_id)
            .copied()
            .unwrap_or(0);

        StoredMessage {
            id: new_message_id(),
            version,
            channel_version,
            depth,
            trace_id: envelope.trace_id,
            stream_name: envelope.stream_name,
            message: envelope.message,
        }
    }

    /// Append an already stamped message and advance the counters past it.
    fn push(&mut self, message: StoredMessage) {
        self.stream_versions
            .insert(message.stream_name.clone(), message.version);
        self.channel_versions
            .insert(message.stream_name.channel(), message.channel_version);
        self.trace_depths.insert(message.trace_id, message.depth + 1);
        self.messages.push(message);
    }

    fn len(&self) -> usize {
        self.messages.len()
    }

    fn trace(&self, trace_id: TraceId) -> Vec<StoredMessage> {
        self.select(|m| m.trace_id == trace_id)
    }

    fn dispatcher_stream(&self, subscriptions: &[DispatcherSubscription]) -> Vec<StoredMessage> {
        self.select(|m| matches_subscriptions(m, subscriptions))
    }

    fn aggregate_stream(&self, channels: &[Channel], id: &str) -> Vec<StoredMessage> {
        self.select(|m| m.stream_name.id == id && channels.iter().any(|c| m.stream_name.in_channel(c)))
    }

    fn select(&self, predicate: impl Fn(&StoredMessage) -> bool) -> Vec<StoredMessage> {
        self.messages.iter().filter(|m| predicate(m)).cloned().collect()
    }
}

/// Volatile backend. The default for [`MessageStore::in_memory`](crate::MessageStore::in_memory).
#[derive(Debug, Default)]
pub struct InMemoryMessageStoreDb {
    log: RwLock<MessageLog>,
}

impl InMemoryMessageStoreDb {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStoreDb for InMemoryMessageStoreDb {
    async fn log_message(&self, envelope: Envelope) -> Result<StoredMessage, StoreError> {
        let mut log = self.log.write().await;
        let stored = log.stamp(envelope);
        log.push(stored.clone());
        Ok(stored)
    }

    async fn get_trace(&self, trace_id: TraceId) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self.log.read().await.trace(trace_id))
    }

    async fn get_dispatcher_stream(
        &self,
        subscriptions: &[DispatcherSubscription],
    ) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self.log.read().await.dispatcher_stream(subscriptions))
    }

    async fn get_aggregate_stream(
        &self,
        channels: &[Channel],
        id: &str,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self.log.read().await.aggregate_stream(channels, id))
    }
}

/// File `EventWriter` appends to inside the log directory.
const LOG_FILE: &str = "app.jsonl";

/// Ordering metadata carried in each event's `meta`.
#[derive(Serialize, Deserialize)]
struct EntryMeta {
    id: MessageId,
    trace_id: TraceId,
    stream_name: StreamName,
    version: u64,
    channel_version: u64,
    depth: u64,
}

/// Map a stored message onto an `eventfold::Event`: the tag becomes
/// `event_type`, the payload becomes `data`, everything else goes in `meta`.
fn to_event(message: &StoredMessage) -> serde_json::Result<Event> {
    let meta = serde_json::to_value(EntryMeta {
        id: message.id,
        trace_id: message.trace_id,
        stream_name: message.stream_name.clone(),
        version: message.version,
        channel_version: message.channel_version,
        depth: message.depth,
    })?;
    let data = message.message.payload.clone().unwrap_or(Value::Null);
    Ok(Event::new(message.message.tag.as_str(), data).with_meta(meta))
}

fn from_event(event: Event) -> Result<StoredMessage, String> {
    let meta = event
        .meta
        .ok_or_else(|| format!("'{}' event has no ordering metadata", event.event_type))?;
    let meta: EntryMeta = serde_json::from_value(meta).map_err(|e| e.to_string())?;
    // A null payload and an absent one are stored the same way.
    let payload = (!event.data.is_null()).then_some(event.data);
    Ok(StoredMessage {
        id: meta.id,
        version: meta.version,
        channel_version: meta.channel_version,
        depth: meta.depth,
        trace_id: meta.trace_id,
        stream_name: meta.stream_name,
        message: Message {
            tag: event.event_type,
            payload,
        },
    })
}

/// Cut an unterminated final line left behind by an interrupted append.
fn trim_torn_tail(path: &Path) -> io::Result<()> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if bytes.last().is_none_or(|&b| b == b'\n') {
        return Ok(());
    }
    let keep = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    tracing::warn!(
        path = %path.display(),
        dropped_bytes = bytes.len() - keep,
        "truncating torn tail of message log"
    );
    OpenOptions::new().write(true).open(path)?.set_len(keep as u64)
}

/// Rebuild the index from every event in the log.
fn replay(reader: &EventReader) -> Result<MessageLog, StoreError> {
    let mut log = MessageLog::default();
    let entries = match reader.read_from(0) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(log),
        Err(e) => return Err(e.into()),
    };
    for (i, entry) in entries.enumerate() {
        let corrupt = |reason: String| StoreError::Corrupt {
            entry: i + 1,
            reason,
        };
        let (event, _, _) = match entry {
            Ok(entry) => entry,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => return Err(corrupt(e.to_string())),
            Err(e) => return Err(e.into()),
        };
        log.push(from_event(event).map_err(corrupt)?);
    }
    Ok(log)
}

/// Durable backend over an `eventfold` append-only JSONL log.
///
/// Each message is one `eventfold::Event` in `<dir>/app.jsonl`. Opening the
/// directory replays the log into an in-memory index, so reads never touch
/// the disk and counters continue where the previous process stopped. The
/// writer holds an exclusive lock on the log until the backend is dropped.
pub struct JsonlMessageStoreDb {
    dir: PathBuf,
    // Held for the whole append so stamping and writing are one step.
    writer: Mutex<EventWriter>,
    log: RwLock<MessageLog>,
}

impl std::fmt::Debug for JsonlMessageStoreDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlMessageStoreDb")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl JsonlMessageStoreDb {
    /// Open or create the log in directory `dir`.
    ///
    /// An unterminated last line, left by a process that died mid-append,
    /// is truncated with a warning before the log is replayed.
    ///
    /// # Arguments
    ///
    /// * `dir` - Directory holding the log; created if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the log cannot be opened, locked, or
    /// read, and [`StoreError::Corrupt`] if a complete entry is not a valid
    /// message.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        trim_torn_tail(&dir.join(LOG_FILE))?;

        let writer = EventWriter::open(&dir)?;
        let log = replay(&writer.reader())?;

        tracing::debug!(dir = %dir.display(), messages = log.len(), "opened message log");

        Ok(Self {
            dir,
            writer: Mutex::new(writer),
            log: RwLock::new(log),
        })
    }

    /// Directory holding the log.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl MessageStoreDb for JsonlMessageStoreDb {
    async fn log_message(&self, envelope: Envelope) -> Result<StoredMessage, StoreError> {
        let mut writer = self.writer.lock().await;
        let stored = self.log.read().await.stamp(envelope);

        let event = to_event(&stored)?;
        if let Err(e) = writer.append(&event) {
            // The next append must not land on a partial line.
            if let Err(trim) = trim_torn_tail(&self.dir.join(LOG_FILE)) {
                tracing::warn!(error = %trim, "could not trim message log after failed append");
            }
            return Err(e.into());
        }

        self.log.write().await.push(stored.clone());
        Ok(stored)
    }

    async fn get_trace(&self, trace_id: TraceId) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self.log.read().await.trace(trace_id))
    }

    async fn get_dispatcher_stream(
        &self,
        subscriptions: &[DispatcherSubscription],
    ) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self.log.read().await.dispatcher_stream(subscriptions))
    }

    async fn get_aggregate_stream(
        &self,
        channels: &[Channel],
        id: &str,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self.log.read().await.aggregate_stream(channels, id))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::message::new_trace_id;

    fn envelope(trace_id: TraceId, channel: &str, id: &str) -> Envelope {
        Envelope::new(
            trace_id,
            StreamName::new("svc", channel, id),
            Message::new("Ping"),
        )
    }

    async fn assert_counters(db: &dyn MessageStoreDb) {
        let trace = new_trace_id();
        let a1 = db.log_message(envelope(trace, "ping", "a")).await.expect("log");
        let b1 = db.log_message(envelope(trace, "ping", "b")).await.expect("log");
        let a2 = db.log_message(envelope(new_trace_id(), "ping", "a")).await.expect("log");
        let p1 = db.log_message(envelope(trace, "pong", "a")).await.expect("log");

        assert_eq!((a1.version, a1.channel_version, a1.depth), (1, 1, 0));
        assert_eq!((b1.version, b1.channel_version, b1.depth), (1, 2, 1));
        assert_eq!((a2.version, a2.channel_version, a2.depth), (2, 3, 0));
        assert_eq!((p1.version, p1.channel_version, p1.depth), (1, 1, 2));

        let ids: Vec<_> = db.get_trace(trace).await.expect("trace").iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a1.id, b1.id, p1.id]);
    }

    #[tokio::test]
    async fn in_memory_assigns_stream_channel_and_trace_counters() {
        assert_counters(&InMemoryMessageStoreDb::new()).await;
    }

    #[tokio::test]
    async fn jsonl_assigns_stream_channel_and_trace_counters() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let db = JsonlMessageStoreDb::open(tmp.path().join("log")).expect("open");
        assert_counters(&db).await;
    }

    #[tokio::test]
    async fn dispatcher_stream_respects_channel_and_offset() {
        let db = InMemoryMessageStoreDb::new();
        let trace = new_trace_id();
        for id in ["a", "b", "c"] {
            db.log_message(envelope(trace, "ping", id)).await.expect("log");
            db.log_message(envelope(trace, "pong", id)).await.expect("log");
        }

        let subs = [DispatcherSubscription::at(Channel::new("svc", "ping"), 1)];
        let versions: Vec<_> = db
            .get_dispatcher_stream(&subs)
            .await
            .expect("query")
            .iter()
            .map(|m| (m.stream_name.channel.clone(), m.channel_version))
            .collect();
        assert_eq!(versions, vec![("ping".into(), 2), ("ping".into(), 3)]);
    }

    #[tokio::test]
    async fn aggregate_stream_spans_event_channels_for_one_instance() {
        let db = InMemoryMessageStoreDb::new();
        let trace = new_trace_id();
        db.log_message(envelope(trace, "events", "a")).await.expect("log");
        db.log_message(envelope(trace, "events", "b")).await.expect("log");
        db.log_message(envelope(trace, "audit", "a")).await.expect("log");
        db.log_message(envelope(trace, "commands", "a")).await.expect("log");

        let channels = [Channel::new("svc", "events"), Channel::new("svc", "audit")];
        let stream = db.get_aggregate_stream(&channels, "a").await.expect("query");
        let names: Vec<_> = stream.iter().map(|m| m.stream_name.channel.as_str()).collect();
        assert_eq!(names, vec!["events", "audit"]);
        assert!(stream.iter().all(|m| m.stream_name.id == "a"));
    }

    #[tokio::test]
    async fn jsonl_reopen_continues_counters() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let dir = tmp.path().join("nested").join("log");
        let trace = new_trace_id();

        {
            let db = JsonlMessageStoreDb::open(&dir).expect("open");
            db.log_message(envelope(trace, "ping", "a")).await.expect("log");
            db.log_message(envelope(trace, "ping", "a")).await.expect("log");
        }

        let db = JsonlMessageStoreDb::open(&dir).expect("reopen");
        assert_eq!(db.dir(), dir);
        let third = db.log_message(envelope(trace, "ping", "a")).await.expect("log");
        assert_eq!((third.version, third.channel_version, third.depth), (3, 3, 2));
        assert_eq!(db.get_trace(trace).await.expect("trace").len(), 3);
    }

    #[tokio::test]
    async fn jsonl_entries_are_eventfold_events_with_ordering_meta() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let dir = tmp.path().join("log");
        let trace = new_trace_id();
        let sent = Envelope::new(
            trace,
            StreamName::new("svc", "ping", "a"),
            Message::with_payload("PingMultiple", serde_json::json!(3)),
        );

        let stored = {
            let db = JsonlMessageStoreDb::open(&dir).expect("open");
            db.log_message(sent).await.expect("log")
        };

        let writer = EventWriter::open(&dir).expect("open writer");
        let mut events: Vec<Event> = writer
            .reader()
            .read_from(0)
            .expect("read log")
            .map(|entry| entry.expect("valid entry").0)
            .collect();
        assert_eq!(events.len(), 1);
        let event = events.remove(0);
        assert_eq!(event.event_type, "PingMultiple");
        assert_eq!(event.data, serde_json::json!(3));
        let meta = event.meta.as_ref().expect("meta should be present");
        assert_eq!(meta["trace_id"], serde_json::json!(trace));
        assert_eq!(meta["version"], 1);
        assert_eq!(meta["depth"], 0);

        let restored = from_event(event).expect("decodes back");
        assert_eq!(restored, stored);
    }

    #[tokio::test]
    async fn jsonl_open_drops_torn_tail_and_keeps_appending() {
        use std::io::Write;

        let tmp = TempDir::new().expect("failed to create temp dir");
        let dir = tmp.path().join("log");
        let trace = new_trace_id();

        {
            let db = JsonlMessageStoreDb::open(&dir).expect("open");
            db.log_message(envelope(trace, "ping", "a")).await.expect("log");
            db.log_message(envelope(trace, "ping", "a")).await.expect("log");
        }

        // Simulate a crash halfway through writing a third entry.
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.join(LOG_FILE))
            .expect("open log file");
        file.write_all(br#"{"event_type":"Ping","da"#)
            .expect("write fragment");
        drop(file);

        {
            let db = JsonlMessageStoreDb::open(&dir).expect("torn tail must not fail open");
            assert_eq!(db.get_trace(trace).await.expect("trace").len(), 2);
            let third = db.log_message(envelope(trace, "ping", "a")).await.expect("log");
            assert_eq!((third.version, third.channel_version, third.depth), (3, 3, 2));
        }

        let db = JsonlMessageStoreDb::open(&dir).expect("reopen");
        let versions: Vec<_> = db
            .get_trace(trace)
            .await
            .expect("trace")
            .iter()
            .map(|m| m.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn trim_torn_tail_keeps_complete_lines() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = tmp.path().join(LOG_FILE);

        trim_torn_tail(&path).expect("missing file is fine");

        std::fs::write(&path, "one\ntwo\n").expect("write");
        trim_torn_tail(&path).expect("trim");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "one\ntwo\n");

        std::fs::write(&path, "one\ntw").expect("write");
        trim_torn_tail(&path).expect("trim");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "one\n");

        std::fs::write(&path, "partial").expect("write");
        trim_torn_tail(&path).expect("trim");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "");
    }

    #[test]
    fn jsonl_open_reports_entry_without_ordering_meta() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let dir = tmp.path().join("log");
        std::fs::create_dir_all(&dir).expect("create dir");
        {
            let mut writer = EventWriter::open(&dir).expect("open writer");
            writer
                .append(&Event::new("Ping", Value::Null))
                .expect("append");
        }

        let err = JsonlMessageStoreDb::open(&dir).expect_err("foreign entry must fail");
        assert!(matches!(err, StoreError::Corrupt { entry: 1, .. }), "got {err:?}");
    }
}
