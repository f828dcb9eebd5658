use super::{
    AppendRecord, BackendError, ReadCursor, StartPosition, StreamBackend, StreamEntry,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};

/// Sequence token in the `<millis>-<counter>` format used by Redis
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
struct EntryId(u64, u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.0, self.1)
    }
}

impl FromStr for EntryId {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BackendError::InvalidId(s.to_owned());
        let mut parts = s.splitn(2, '-');

        let millis = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let counter = match parts.next() {
            Some(p) => p.parse().map_err(|_| invalid())?,
            None => 0,
        };

        Ok(EntryId(millis, counter))
    }
}

struct PendingEntry {
    consumer: String,
    deliveries: u32,
}

#[derive(Default)]
struct Group {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Default)]
struct Stream {
    last_id: EntryId,
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn next_id(&mut self) -> EntryId {
        let millis = Utc::now().timestamp_millis().max(0) as u64;

        self.last_id = if millis > self.last_id.0 {
            EntryId(millis, 0)
        } else {
            EntryId(self.last_id.0, self.last_id.1 + 1)
        };

        self.last_id
    }

    fn push(&mut self, fields: Vec<(String, String)>, max_len: Option<usize>) -> EntryId {
        let id = self.next_id();
        self.entries.insert(id, fields.into_iter().collect());

        if let Some(max_len) = max_len {
            self.trim(max_len);
        }

        id
    }

    fn trim(&mut self, max_len: usize) -> usize {
        let mut evicted = 0;

        while self.entries.len() > max_len {
            let oldest = match self.entries.keys().next() {
                Some(id) => *id,
                None => break,
            };
            self.entries.remove(&oldest);
            evicted += 1;
        }

        evicted
    }

    fn entry(&self, id: EntryId) -> StreamEntry {
        StreamEntry {
            id: id.to_string(),
            fields: self.entries.get(&id).cloned().unwrap_or_default(),
        }
    }
}

/// In-process implementation of the [`StreamBackend`] contract
///
/// Mirrors the semantics of Redis Streams closely enough that every component can be exercised
/// against it, including blocking reads that wake up as soon as new entries are appended.
#[derive(Default)]
pub struct MemoryBackend {
    streams: Mutex<HashMap<String, Stream>>,
    appended: Notify,
    closed: AtomicBool,
}

impl MemoryBackend {
    /// Creates an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }

    /// Number of times an entry has been handed out to consumers of a group, `None` if it is not pending
    pub async fn delivery_count(&self, stream: &str, group: &str, id: &str) -> Option<u32> {
        let id = id.parse::<EntryId>().ok()?;
        let streams = self.streams.lock().await;

        streams
            .get(stream)?
            .groups
            .get(group)?
            .pending
            .get(&id)
            .map(|entry| entry.deliveries)
    }

    fn try_read(
        streams: &mut HashMap<String, Stream>,
        stream_key: &str,
        group_name: &str,
        consumer: &str,
        cursor: &ReadCursor,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BackendError> {
        let no_group = || BackendError::NoGroup {
            stream: stream_key.to_owned(),
            group: group_name.to_owned(),
        };

        let stream = streams.get_mut(stream_key).ok_or_else(no_group)?;
        let Stream {
            entries, groups, ..
        } = stream;
        let group = groups.get_mut(group_name).ok_or_else(no_group)?;

        let ids: Vec<EntryId> = match cursor {
            ReadCursor::Pending(after) => {
                let after = after.parse::<EntryId>()?;
                group
                    .pending
                    .iter()
                    .filter(|(id, entry)| **id > after && entry.consumer == consumer)
                    .map(|(id, _)| *id)
                    .take(count)
                    .collect()
            }
            ReadCursor::New => {
                let ids: Vec<EntryId> = entries
                    .range(group.last_delivered..)
                    .map(|(id, _)| *id)
                    .filter(|id| *id > group.last_delivered)
                    .take(count)
                    .collect();

                if let Some(last) = ids.last() {
                    group.last_delivered = *last;
                }

                ids
            }
        };

        let delivered = ids
            .into_iter()
            .map(|id| {
                let pending = group.pending.entry(id).or_insert_with(|| PendingEntry {
                    consumer: consumer.to_owned(),
                    deliveries: 0,
                });
                pending.consumer = consumer.to_owned();
                pending.deliveries += 1;

                StreamEntry {
                    id: id.to_string(),
                    fields: entries.get(&id).cloned().unwrap_or_default(),
                }
            })
            .collect();

        Ok(delivered)
    }
}

#[async_trait]
impl StreamBackend for MemoryBackend {
    async fn append(
        &self,
        stream: &str,
        fields: Vec<(String, String)>,
        max_len: Option<usize>,
    ) -> Result<String, BackendError> {
        self.ensure_open()?;

        let id = self
            .streams
            .lock()
            .await
            .entry(stream.to_owned())
            .or_default()
            .push(fields, max_len);

        self.appended.notify_waiters();

        Ok(id.to_string())
    }

    async fn append_batch(
        &self,
        records: Vec<AppendRecord>,
        max_len: Option<usize>,
    ) -> Result<Vec<String>, BackendError> {
        self.ensure_open()?;

        let ids = {
            let mut streams = self.streams.lock().await;

            records
                .into_iter()
                .map(|record| {
                    streams
                        .entry(record.stream)
                        .or_default()
                        .push(record.fields, max_len)
                        .to_string()
                })
                .collect()
        };

        self.appended.notify_waiters();

        Ok(ids)
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), BackendError> {
        self.ensure_open()?;

        let mut streams = self.streams.lock().await;
        let stream = streams.entry(stream.to_owned()).or_default();
        let last_id = stream.last_id;

        stream.groups.entry(group.to_owned()).or_insert_with(|| Group {
            last_delivered: match start {
                StartPosition::Beginning => EntryId::default(),
                StartPosition::End => last_id,
            },
            pending: BTreeMap::new(),
        });

        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BackendError> {
        let deadline = Instant::now() + block;

        loop {
            // Register interest before inspecting the state so no append slips through
            let appended = self.appended.notified();
            self.ensure_open()?;

            let entries = {
                let mut streams = self.streams.lock().await;
                Self::try_read(&mut streams, stream, group, consumer, &cursor, count)?
            };

            let blocking = cursor == ReadCursor::New && !block.is_zero();
            if !entries.is_empty() || !blocking || Instant::now() >= deadline {
                return Ok(entries);
            }

            if timeout_at(deadline, appended).await.is_err() {
                self.ensure_open()?;
                return Ok(Vec::new());
            }
        }
    }

    async fn acknowledge(
        &self,
        stream: &str,
        group: &str,
        ids: &[String],
    ) -> Result<usize, BackendError> {
        self.ensure_open()?;

        let mut streams = self.streams.lock().await;
        let group = match streams
            .get_mut(stream)
            .and_then(|stream| stream.groups.get_mut(group))
        {
            Some(group) => group,
            None => return Ok(0),
        };

        let mut acknowledged = 0;
        for id in ids {
            if group.pending.remove(&id.parse::<EntryId>()?).is_some() {
                acknowledged += 1;
            }
        }

        Ok(acknowledged)
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<usize, BackendError> {
        self.ensure_open()?;

        let streams = self.streams.lock().await;
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .ok_or_else(|| BackendError::NoGroup {
                stream: stream.to_owned(),
                group: group.to_owned(),
            })
    }

    async fn range(
        &self,
        stream: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StreamEntry>, BackendError> {
        self.ensure_open()?;

        let streams = self.streams.lock().await;
        let entries = match streams.get(stream) {
            Some(stream) => stream
                .entries
                .keys()
                .skip(offset)
                .take(limit)
                .map(|id| stream.entry(*id))
                .collect(),
            None => Vec::new(),
        };

        Ok(entries)
    }

    async fn get(&self, stream: &str, id: &str) -> Result<Option<StreamEntry>, BackendError> {
        self.ensure_open()?;

        let id = id.parse::<EntryId>()?;
        let streams = self.streams.lock().await;

        Ok(streams
            .get(stream)
            .filter(|stream| stream.entries.contains_key(&id))
            .map(|stream| stream.entry(id)))
    }

    async fn delete(&self, stream: &str, ids: &[String]) -> Result<usize, BackendError> {
        self.ensure_open()?;

        let mut streams = self.streams.lock().await;
        let stream = match streams.get_mut(stream) {
            Some(stream) => stream,
            None => return Ok(0),
        };

        let mut deleted = 0;
        for id in ids {
            if stream.entries.remove(&id.parse::<EntryId>()?).is_some() {
                deleted += 1;
            }
        }

        Ok(deleted)
    }

    async fn len(&self, stream: &str) -> Result<usize, BackendError> {
        self.ensure_open()?;

        let streams = self.streams.lock().await;
        Ok(streams.get(stream).map(|s| s.entries.len()).unwrap_or(0))
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<usize, BackendError> {
        self.ensure_open()?;

        let mut streams = self.streams.lock().await;
        Ok(streams
            .get_mut(stream)
            .map(|stream| stream.trim(max_len))
            .unwrap_or(0))
    }

    async fn remove(&self, stream: &str) -> Result<(), BackendError> {
        self.ensure_open()?;
        self.streams.lock().await.remove(stream);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::SeqCst);
        self.appended.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const STREAM: &str = "activity.created";
    const GROUP: &str = "chat";

    fn fields(value: &str) -> Vec<(String, String)> {
        vec![("value".to_owned(), value.to_owned())]
    }

    fn values(entries: &[StreamEntry]) -> Vec<&str> {
        entries
            .iter()
            .map(|e| e.fields.get("value").map(String::as_str).unwrap_or(""))
            .collect()
    }

    async fn backend_with(values: &[&str]) -> MemoryBackend {
        let backend = MemoryBackend::new();
        for value in values {
            backend.append(STREAM, fields(value), None).await.unwrap();
        }
        backend
    }

    #[tokio::test]
    async fn assign_increasing_ids() {
        let backend = MemoryBackend::new();
        let a = backend.append(STREAM, fields("a"), None).await.unwrap();
        let b = backend.append(STREAM, fields("b"), None).await.unwrap();

        assert!(a.parse::<EntryId>().unwrap() < b.parse::<EntryId>().unwrap());
    }

    #[tokio::test]
    async fn deliver_existing_entries_to_new_group() {
        let backend = backend_with(&["a", "b", "c"]).await;
        backend
            .ensure_group(STREAM, GROUP, StartPosition::Beginning)
            .await
            .unwrap();

        let first = backend
            .read_group(STREAM, GROUP, "c1", ReadCursor::New, 2, Duration::ZERO)
            .await
            .unwrap();
        let second = backend
            .read_group(STREAM, GROUP, "c1", ReadCursor::New, 2, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(values(&first), vec!["a", "b"]);
        assert_eq!(values(&second), vec!["c"]);
        assert_eq!(backend.pending(STREAM, GROUP).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn skip_history_when_starting_at_end() {
        let backend = backend_with(&["old"]).await;
        backend
            .ensure_group(STREAM, GROUP, StartPosition::End)
            .await
            .unwrap();
        backend.append(STREAM, fields("new"), None).await.unwrap();

        let entries = backend
            .read_group(STREAM, GROUP, "c1", ReadCursor::New, 10, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(values(&entries), vec!["new"]);
    }

    #[tokio::test]
    async fn keep_groups_independent() {
        let backend = backend_with(&["a"]).await;
        for group in &["one", "two"] {
            backend
                .ensure_group(STREAM, group, StartPosition::Beginning)
                .await
                .unwrap();
        }

        for group in &["one", "two"] {
            let entries = backend
                .read_group(STREAM, group, "c", ReadCursor::New, 10, Duration::ZERO)
                .await
                .unwrap();
            assert_eq!(values(&entries), vec!["a"]);
        }
    }

    #[tokio::test]
    async fn replay_unacknowledged_entries() {
        let backend = backend_with(&["a", "b"]).await;
        backend
            .ensure_group(STREAM, GROUP, StartPosition::Beginning)
            .await
            .unwrap();

        let delivered = backend
            .read_group(STREAM, GROUP, "c1", ReadCursor::New, 10, Duration::ZERO)
            .await
            .unwrap();
        backend
            .acknowledge(STREAM, GROUP, &[delivered[0].id.clone()])
            .await
            .unwrap();

        let replayed = backend
            .read_group(
                STREAM,
                GROUP,
                "c1",
                ReadCursor::pending_from_start(),
                10,
                Duration::ZERO,
            )
            .await
            .unwrap();
        let foreign = backend
            .read_group(
                STREAM,
                GROUP,
                "c2",
                ReadCursor::pending_from_start(),
                10,
                Duration::ZERO,
            )
            .await
            .unwrap();

        assert_eq!(values(&replayed), vec!["b"]);
        assert!(foreign.is_empty());
        assert_eq!(
            backend.delivery_count(STREAM, GROUP, &delivered[1].id).await,
            Some(2)
        );
    }

    #[tokio::test]
    async fn wake_blocked_readers() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .ensure_group(STREAM, GROUP, StartPosition::Beginning)
            .await
            .unwrap();

        let reader = {
            let backend = backend.clone();
            tokio::spawn(async move {
                backend
                    .read_group(STREAM, GROUP, "c1", ReadCursor::New, 10, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.append(STREAM, fields("late"), None).await.unwrap();

        let entries = reader.await.unwrap().unwrap();
        assert_eq!(values(&entries), vec!["late"]);
    }

    #[tokio::test]
    async fn return_empty_after_block_time() {
        let backend = MemoryBackend::new();
        backend
            .ensure_group(STREAM, GROUP, StartPosition::Beginning)
            .await
            .unwrap();

        let entries = backend
            .read_group(STREAM, GROUP, "c1", ReadCursor::New, 10, Duration::from_millis(10))
            .await
            .unwrap();

        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn reject_reads_without_group() {
        let backend = backend_with(&["a"]).await;
        let result = backend
            .read_group(STREAM, GROUP, "c1", ReadCursor::New, 1, Duration::ZERO)
            .await;

        assert!(matches!(result, Err(BackendError::NoGroup { .. })));
    }

    #[tokio::test]
    async fn page_delete_and_trim() {
        let backend = backend_with(&["a", "b", "c", "d"]).await;

        let page = backend.range(STREAM, 1, 2).await.unwrap();
        assert_eq!(values(&page), vec!["b", "c"]);

        assert_eq!(backend.delete(STREAM, &[page[0].id.clone()]).await.unwrap(), 1);
        assert_eq!(backend.get(STREAM, &page[0].id).await.unwrap(), None);
        assert_eq!(backend.len(STREAM).await.unwrap(), 3);

        assert_eq!(backend.trim(STREAM, 1).await.unwrap(), 2);
        assert_eq!(values(&backend.range(STREAM, 0, 10).await.unwrap()), vec!["d"]);

        backend.remove(STREAM).await.unwrap();
        assert_eq!(backend.len(STREAM).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refuse_work_after_close() {
        let backend = MemoryBackend::new();
        backend.close().await.unwrap();

        assert!(matches!(
            backend.health_check().await,
            Err(BackendError::Closed)
        ));
        assert!(matches!(
            backend.append(STREAM, fields("a"), None).await,
            Err(BackendError::Closed)
        ));
    }
}
