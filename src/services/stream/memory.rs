//! In-process stream backend.
//!
//! Mirrors the Redis Streams semantics the pipeline relies on (per-group
//! delivery cursor, pending entries list, idle takeover) so the whole
//! pipeline can run inside one process and in tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{DurableStream, Entry, EntryId, StreamError};

/// Registry of named in-process streams sharing one claim-idle setting.
pub struct MemoryStreams {
    claim_idle: Duration,
    streams: Mutex<HashMap<String, Arc<MemoryStream>>>,
}

impl MemoryStreams {
    pub fn new(claim_idle: Duration) -> Self {
        Self {
            claim_idle,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Handle on `name`, created on first use. All handles on the same name
    /// share one log.
    pub async fn stream(&self, name: &str) -> Arc<dyn DurableStream> {
        self.get(name).await
    }

    /// Like [`MemoryStreams::stream`], keeping the concrete type for
    /// inspection.
    pub async fn get(&self, name: &str) -> Arc<MemoryStream> {
        let mut streams = self.streams.lock().await;
        streams
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStream::new(name, self.claim_idle)))
            .clone()
    }
}

pub struct MemoryStream {
    name: String,
    claim_idle: Duration,
    log: Mutex<Log>,
    appended: Notify,
}

#[derive(Default)]
struct Log {
    entries: Vec<(EntryId, String)>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Group {
    delivered_up_to: EntryId,
    pending: BTreeMap<EntryId, Pending>,
}

struct Pending {
    consumer: String,
    deliveries: u64,
    delivered_at: Instant,
}

impl Log {
    fn next_id(&self) -> EntryId {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        if now > self.last_id.millis {
            EntryId::new(now, 0)
        } else {
            EntryId::new(self.last_id.millis, self.last_id.seq + 1)
        }
    }

    fn first_after(&self, cursor: EntryId) -> Option<&(EntryId, String)> {
        let idx = self.entries.partition_point(|(id, _)| *id <= cursor);
        self.entries.get(idx)
    }
}

fn payload_of(entries: &[(EntryId, String)], id: EntryId) -> String {
    entries
        .binary_search_by_key(&id, |(entry_id, _)| *entry_id)
        .map(|idx| entries[idx].1.clone())
        .unwrap_or_default()
}

impl MemoryStream {
    pub fn new(name: &str, claim_idle: Duration) -> Self {
        Self {
            name: name.to_string(),
            claim_idle,
            log: Mutex::new(Log::default()),
            appended: Notify::new(),
        }
    }

    async fn try_read_group(&self, group: &str, consumer: &str) -> Result<Option<Entry>, StreamError> {
        let mut log = self.log.lock().await;
        let Log { entries, groups, .. } = &mut *log;
        let state = groups.get_mut(group).ok_or_else(|| StreamError::NoSuchGroup {
            stream: self.name.clone(),
            group: group.to_string(),
        })?;
        let now = Instant::now();

        let redeliver = state
            .pending
            .iter()
            .find(|(_, p)| p.consumer == consumer)
            .or_else(|| {
                state.pending.iter().find(|(_, p)| {
                    p.consumer != consumer && now.duration_since(p.delivered_at) >= self.claim_idle
                })
            })
            .map(|(id, _)| *id);

        if let Some(id) = redeliver {
            let pending = state
                .pending
                .get_mut(&id)
                .ok_or_else(|| StreamError::InvalidEntryId(id.to_string()))?;
            pending.consumer = consumer.to_string();
            pending.deliveries += 1;
            pending.delivered_at = now;
            let deliveries = pending.deliveries;

            return Ok(Some(Entry {
                id,
                payload: payload_of(entries, id),
                deliveries,
            }));
        }

        let idx = entries.partition_point(|(id, _)| *id <= state.delivered_up_to);
        let Some((id, payload)) = entries.get(idx) else {
            return Ok(None);
        };
        state.delivered_up_to = *id;
        state.pending.insert(
            *id,
            Pending {
                consumer: consumer.to_string(),
                deliveries: 1,
                delivered_at: now,
            },
        );

        Ok(Some(Entry {
            id: *id,
            payload: payload.clone(),
            deliveries: 1,
        }))
    }

    /// Number of delivered but unacknowledged entries in `group`.
    pub async fn pending_count(&self, group: &str) -> usize {
        let log = self.log.lock().await;
        log.groups.get(group).map_or(0, |g| g.pending.len())
    }

    pub async fn len(&self) -> usize {
        self.log.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DurableStream for MemoryStream {
    fn name(&self) -> &str {
        &self.name
    }

    async fn append(&self, payload: &str) -> Result<EntryId, StreamError> {
        let id = {
            let mut log = self.log.lock().await;
            let id = log.next_id();
            log.entries.push((id, payload.to_string()));
            log.last_id = id;
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_consumer_group(&self, group: &str) -> Result<(), StreamError> {
        let mut log = self.log.lock().await;
        log.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_next(
        &self,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<Entry>, StreamError> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.try_read_group(group, consumer).await? {
                return Ok(Some(entry));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, group: &str, id: EntryId) -> Result<(), StreamError> {
        let mut log = self.log.lock().await;
        if let Some(state) = log.groups.get_mut(group) {
            state.pending.remove(&id);
        }
        Ok(())
    }

    async fn tail(&self, cursor: EntryId, block: Duration) -> Result<Option<Entry>, StreamError> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let log = self.log.lock().await;
                if let Some((id, payload)) = log.first_after(cursor) {
                    return Ok(Some(Entry {
                        id: *id,
                        payload: payload.clone(),
                        deliveries: 1,
                    }));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn last_id(&self) -> Result<EntryId, StreamError> {
        Ok(self.log.lock().await.last_id)
    }

    async fn health_check(&self) -> Result<(), StreamError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const GROUP: &str = "group";
    const NO_WAIT: Duration = Duration::from_millis(0);

    fn stream() -> Arc<MemoryStream> {
        Arc::new(MemoryStream::new("jobs", Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let s = stream();
        let mut last = EntryId::ZERO;
        for i in 0..50 {
            let id = s.append(&i.to_string()).await.unwrap();
            assert!(id > last);
            last = id;
        }
        assert_eq!(s.last_id().await.unwrap(), last);
        assert_eq!(s.len().await, 50);
    }

    #[tokio::test]
    async fn creating_a_group_twice_is_a_noop() {
        let s = stream();
        s.append("a").await.unwrap();
        s.create_consumer_group(GROUP).await.unwrap();
        let first = s.read_next(GROUP, "c1", NO_WAIT).await.unwrap().unwrap();

        s.create_consumer_group(GROUP).await.unwrap();
        assert_eq!(s.pending_count(GROUP).await, 1);
        assert_eq!(first.payload, "a");
    }

    #[tokio::test]
    async fn reading_an_unknown_group_fails() {
        let s = stream();
        let err = s.read_next("missing", "c1", NO_WAIT).await.unwrap_err();
        assert!(matches!(err, StreamError::NoSuchGroup { .. }));
    }

    #[tokio::test]
    async fn group_delivers_each_entry_to_one_consumer() {
        let s = stream();
        s.create_consumer_group(GROUP).await.unwrap();
        for i in 0..10 {
            s.append(&i.to_string()).await.unwrap();
        }

        let mut seen = HashSet::new();
        for round in 0..5 {
            for consumer in ["c1", "c2"] {
                let entry = s.read_next(GROUP, consumer, NO_WAIT).await.unwrap().unwrap();
                assert_eq!(entry.deliveries, 1, "round {round}");
                assert!(seen.insert(entry.payload.clone()));
                s.ack(GROUP, entry.id).await.unwrap();
            }
        }
        assert_eq!(seen.len(), 10);
        assert!(s.read_next(GROUP, "c1", NO_WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unacked_entries_are_redelivered_to_their_consumer_first() {
        let s = stream();
        s.create_consumer_group(GROUP).await.unwrap();
        s.append("first").await.unwrap();
        s.append("second").await.unwrap();

        let first = s.read_next(GROUP, "c1", NO_WAIT).await.unwrap().unwrap();
        let again = s.read_next(GROUP, "c1", NO_WAIT).await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.deliveries, 2);

        // Another consumer cannot see it while it is fresh.
        let other = s.read_next(GROUP, "c2", NO_WAIT).await.unwrap().unwrap();
        assert_eq!(other.payload, "second");

        s.ack(GROUP, first.id).await.unwrap();
        assert!(s.read_next(GROUP, "c1", NO_WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn idle_entries_are_claimed_by_other_consumers() {
        let s = Arc::new(MemoryStream::new("jobs", Duration::from_millis(20)));
        s.create_consumer_group(GROUP).await.unwrap();
        s.append("orphan").await.unwrap();

        let taken = s.read_next(GROUP, "dead", NO_WAIT).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let claimed = s.read_next(GROUP, "alive", NO_WAIT).await.unwrap().unwrap();
        assert_eq!(claimed.id, taken.id);
        assert_eq!(claimed.deliveries, 2);
        assert_eq!(s.pending_count(GROUP).await, 1);
    }

    #[tokio::test]
    async fn ack_is_idempotent() {
        let s = stream();
        s.create_consumer_group(GROUP).await.unwrap();
        s.append("a").await.unwrap();
        let entry = s.read_next(GROUP, "c1", NO_WAIT).await.unwrap().unwrap();

        s.ack(GROUP, entry.id).await.unwrap();
        s.ack(GROUP, entry.id).await.unwrap();
        s.ack(GROUP, EntryId::new(1, 1)).await.unwrap();
        s.ack("other", entry.id).await.unwrap();
        assert_eq!(s.pending_count(GROUP).await, 0);
    }

    #[tokio::test]
    async fn blocked_read_wakes_on_append() {
        let s = stream();
        s.create_consumer_group(GROUP).await.unwrap();

        let reader = {
            let s = s.clone();
            tokio::spawn(async move { s.read_next(GROUP, "c1", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        s.append("late").await.unwrap();

        let entry = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(entry.payload, "late");
    }

    #[tokio::test]
    async fn blocked_read_times_out_empty() {
        let s = stream();
        s.create_consumer_group(GROUP).await.unwrap();
        let started = Instant::now();
        let entry = s
            .read_next(GROUP, "c1", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(entry.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn tail_starts_after_cursor() {
        let s = stream();
        s.append("old").await.unwrap();
        let cursor = s.last_id().await.unwrap();
        assert!(s.tail(cursor, NO_WAIT).await.unwrap().is_none());

        s.append("new-1").await.unwrap();
        s.append("new-2").await.unwrap();

        let first = s.tail(cursor, NO_WAIT).await.unwrap().unwrap();
        assert_eq!(first.payload, "new-1");
        let second = s.tail(first.id, NO_WAIT).await.unwrap().unwrap();
        assert_eq!(second.payload, "new-2");
        assert!(s.tail(second.id, NO_WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tails_are_independent_of_groups() {
        let s = stream();
        s.create_consumer_group(GROUP).await.unwrap();
        s.append("shared").await.unwrap();

        let grouped = s.read_next(GROUP, "c1", NO_WAIT).await.unwrap().unwrap();
        let tailed = s.tail(EntryId::ZERO, NO_WAIT).await.unwrap().unwrap();
        let tailed_again = s.tail(EntryId::ZERO, NO_WAIT).await.unwrap().unwrap();
        assert_eq!(grouped.id, tailed.id);
        assert_eq!(tailed, tailed_again);
    }

    #[tokio::test]
    async fn registry_shares_logs_by_name() {
        let streams = MemoryStreams::new(Duration::from_secs(1));
        let a = streams.stream("jobs").await;
        let b = streams.stream("jobs").await;
        let other = streams.stream("ws").await;

        let id = a.append("x").await.unwrap();
        assert_eq!(b.last_id().await.unwrap(), id);
        assert_eq!(other.last_id().await.unwrap(), EntryId::ZERO);
    }
}
