//! Durable, append-only streams with consumer-group and tail reads.
//!
//! A [`DurableStream`] is a handle on one named stream. Grouped reads
//! (`read_next` / `ack`) give at-least-once, load-balanced delivery across
//! the consumers of a group; `tail` gives every listener its own cursor over
//! newly appended entries.
//!
//! Two backends implement the protocol: Redis Streams ([`redis`]) and an
//! in-process log ([`memory`]). [`StreamBackend`] opens handles on either.

pub mod codec;
pub mod memory;
pub mod redis;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Stream-assigned entry id, `<millis>-<sequence>`, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub millis: u64,
    pub seq: u64,
}

impl EntryId {
    /// Sorts before every real entry; the tail cursor of an empty stream.
    pub const ZERO: EntryId = EntryId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StreamError::InvalidEntryId(s.to_string());
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (s, "0"),
        };
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: EntryId,
    /// Content of the entry's `data` field; empty when the field is missing.
    pub payload: String,
    /// How many times the entry has been handed to the group, this delivery
    /// included. Always 1 for tail reads.
    pub deliveries: u64,
}

/// Handle on a single named stream.
#[async_trait]
pub trait DurableStream: Send + Sync {
    fn name(&self) -> &str;

    /// Append `payload` and return the id the stream assigned to it.
    async fn append(&self, payload: &str) -> Result<EntryId, StreamError>;

    /// Create `group` positioned at the start of the stream. Creating an
    /// existing group is a no-op.
    async fn create_consumer_group(&self, group: &str) -> Result<(), StreamError>;

    /// Deliver at most one entry to `consumer`.
    ///
    /// Entries already delivered to `consumer` but not acknowledged come
    /// first, then entries abandoned by other consumers for longer than the
    /// handle's claim-idle time, then new entries (waiting up to `block`).
    async fn read_next(
        &self,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<Entry>, StreamError>;

    /// Mark `id` processed for `group`. Unknown or already acknowledged ids
    /// are ignored.
    async fn ack(&self, group: &str, id: EntryId) -> Result<(), StreamError>;

    /// First entry strictly after `cursor`, waiting up to `block`.
    async fn tail(&self, cursor: EntryId, block: Duration) -> Result<Option<Entry>, StreamError>;

    /// Id of the newest entry, or [`EntryId::ZERO`] for an empty stream.
    async fn last_id(&self) -> Result<EntryId, StreamError>;

    /// Check connectivity to the backing store.
    async fn health_check(&self) -> Result<(), StreamError>;
}

/// Opens stream handles on the configured backend.
///
/// Blocking reads tie up a Redis connection, so every worker and every live
/// listener opens its own handle.
#[derive(Clone)]
pub enum StreamBackend {
    Redis {
        client: ::redis::Client,
        claim: redis::ClaimPolicy,
    },
    Memory(Arc<memory::MemoryStreams>),
}

impl StreamBackend {
    pub fn redis(redis_url: &str, claim: redis::ClaimPolicy) -> Result<Self, StreamError> {
        let client = ::redis::Client::open(redis_url)?;
        Ok(Self::Redis { client, claim })
    }

    pub fn memory(claim_idle: Duration) -> Self {
        Self::Memory(Arc::new(memory::MemoryStreams::new(claim_idle)))
    }

    pub async fn open(&self, name: &str) -> Result<Arc<dyn DurableStream>, StreamError> {
        match self {
            Self::Redis { client, claim } => Ok(Arc::new(
                redis::RedisStream::connect(client, name, *claim).await?,
            )),
            Self::Memory(streams) => Ok(streams.stream(name).await),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Stream backend unavailable: {0}")]
    Unavailable(#[from] ::redis::RedisError),

    #[error("Invalid stream entry id: {0}")]
    InvalidEntryId(String),

    #[error("Consumer group {group} does not exist on stream {stream}")]
    NoSuchGroup { stream: String, group: String },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
