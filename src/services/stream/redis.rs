//! Redis Streams backend.
//!
//! Grouped reads map onto `XREADGROUP`, `XPENDING`, `XCLAIM` and `XACK`; tail
//! reads onto plain `XREAD`. Payloads live in the single `data` field.
//!
//! Each handle sits on a [`ConnectionManager`], which re-dials Redis after the
//! connection drops; the call that observed the drop fails, later calls run
//! on the new connection.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, RedisError};

use super::codec::DATA_FIELD;
use super::{DurableStream, Entry, EntryId, StreamError};

/// Idle takeover tuning of a Redis stream handle.
#[derive(Debug, Clone, Copy)]
pub struct ClaimPolicy {
    /// Idle time after which another consumer may take over an entry.
    pub idle: Duration,
    /// Pending entries fetched per `XPENDING` page while looking for one.
    pub batch: usize,
}

/// Handle on one Redis stream, owning its own connection.
pub struct RedisStream {
    conn: ConnectionManager,
    name: String,
    claim: ClaimPolicy,
}

impl RedisStream {
    pub async fn connect(
        client: &redis::Client,
        name: &str,
        claim: ClaimPolicy,
    ) -> Result<Self, StreamError> {
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            conn,
            name: name.to_string(),
            claim,
        })
    }

    fn group_error(&self, group: &str, err: RedisError) -> StreamError {
        if err.code() == Some("NOGROUP") {
            StreamError::NoSuchGroup {
                stream: self.name.clone(),
                group: group.to_string(),
            }
        } else {
            StreamError::Unavailable(err)
        }
    }

    /// Re-read the oldest entry already delivered to `consumer` (`XREADGROUP ... 0`).
    async fn read_own_pending(&self, group: &str, consumer: &str) -> Result<Option<Entry>, StreamError> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default().group(group, consumer).count(1);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.name], &["0"], &opts)
            .await
            .map_err(|e| self.group_error(group, e))?;

        let Some(stream_id) = first_id(reply) else {
            return Ok(None);
        };

        // Reading history bumps the delivery counter; XPENDING reports it.
        let pending: StreamPendingCountReply = conn
            .xpending_consumer_count(&self.name, group, &stream_id.id, &stream_id.id, 1, consumer)
            .await?;
        let deliveries = pending
            .ids
            .first()
            .map_or(1, |p| p.times_delivered as u64);

        to_entry(&stream_id, deliveries).map(Some)
    }

    /// Take over an entry another consumer has left unacknowledged for at
    /// least the claim-idle time. The whole pending list is scanned, one
    /// page of `claim.batch` entries at a time.
    async fn claim_idle_entry(&self, group: &str, consumer: &str) -> Result<Option<Entry>, StreamError> {
        let mut conn = self.conn.clone();
        let min_idle = self.claim.idle.as_millis() as usize;
        let batch = self.claim.batch.max(1);
        let mut start = "-".to_string();

        loop {
            let pending: StreamPendingCountReply = conn
                .xpending_count(&self.name, group, &start, "+", batch)
                .await
                .map_err(|e| self.group_error(group, e))?;

            for candidate in pending
                .ids
                .iter()
                .filter(|p| p.consumer != consumer && p.last_delivered_ms >= min_idle)
            {
                // XCLAIM re-checks idleness, so a racing consumer wins at most once.
                let claimed: StreamClaimReply = conn
                    .xclaim(&self.name, group, consumer, min_idle, &[&candidate.id])
                    .await?;
                if let Some(stream_id) = claimed.ids.first() {
                    tracing::info!(
                        stream = %self.name,
                        entry_id = %stream_id.id,
                        from = %candidate.consumer,
                        to = %consumer,
                        "Claimed idle stream entry"
                    );
                    return to_entry(stream_id, candidate.times_delivered as u64 + 1).map(Some);
                }
            }

            match pending.ids.last() {
                Some(last) if pending.ids.len() >= batch => start = format!("({}", last.id),
                _ => return Ok(None),
            }
        }
    }

    async fn read_new(
        &self,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<Entry>, StreamError> {
        let mut conn = self.conn.clone();
        let opts = with_block(StreamReadOptions::default().group(group, consumer).count(1), block);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.name], &[">"], &opts)
            .await
            .map_err(|e| self.group_error(group, e))?;

        match first_id(reply) {
            Some(stream_id) => to_entry(&stream_id, 1).map(Some),
            None => Ok(None),
        }
    }
}

fn with_block(opts: StreamReadOptions, block: Duration) -> StreamReadOptions {
    // BLOCK 0 would wait forever.
    if block.is_zero() {
        opts
    } else {
        opts.block(block.as_millis().max(1) as usize)
    }
}

fn first_id(reply: Option<StreamReadReply>) -> Option<StreamId> {
    reply?.keys.into_iter().next()?.ids.into_iter().next()
}

fn to_entry(stream_id: &StreamId, deliveries: u64) -> Result<Entry, StreamError> {
    Ok(Entry {
        id: stream_id.id.parse()?,
        payload: stream_id.get::<String>(DATA_FIELD).unwrap_or_default(),
        deliveries,
    })
}

#[async_trait]
impl DurableStream for RedisStream {
    fn name(&self) -> &str {
        &self.name
    }

    async fn append(&self, payload: &str) -> Result<EntryId, StreamError> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(&self.name, "*", &[(DATA_FIELD, payload)]).await?;
        id.parse()
    }

    async fn create_consumer_group(&self, group: &str) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(&self.name, group, "0")
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_next(
        &self,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<Entry>, StreamError> {
        if let Some(entry) = self.read_own_pending(group, consumer).await? {
            return Ok(Some(entry));
        }
        if let Some(entry) = self.claim_idle_entry(group, consumer).await? {
            return Ok(Some(entry));
        }
        self.read_new(group, consumer, block).await
    }

    async fn ack(&self, group: &str, id: EntryId) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();
        match conn
            .xack::<_, _, _, i64>(&self.name, group, &[id.to_string()])
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("NOGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn tail(&self, cursor: EntryId, block: Duration) -> Result<Option<Entry>, StreamError> {
        let mut conn = self.conn.clone();
        let opts = with_block(StreamReadOptions::default().count(1), block);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.name], &[cursor.to_string()], &opts)
            .await?;

        match first_id(reply) {
            Some(stream_id) => to_entry(&stream_id, 1).map(Some),
            None => Ok(None),
        }
    }

    async fn last_id(&self) -> Result<EntryId, StreamError> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrevrange_count(&self.name, "+", "-", 1).await?;
        match reply.ids.first() {
            Some(stream_id) => stream_id.id.parse(),
            None => Ok(EntryId::ZERO),
        }
    }

    async fn health_check(&self) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
