//! Completion events fan-out.
//!
//! Workers publish onto the notification stream with a [`Notifier`]; every
//! live connection owns a [`Listener`] tailing the same stream from the
//! moment it connected. Delivery is best effort: events appended while a
//! listener is disconnected are never replayed to it.

use std::sync::Arc;
use std::time::Duration;

use crate::models::job::Job;
use crate::models::notification::{Notification, NotificationEvent};
use crate::services::stream::{codec, DurableStream, EntryId, StreamError};

/// Publishes completion events for jobs with detected faces.
#[derive(Clone)]
pub struct Notifier {
    stream: Arc<dyn DurableStream>,
    static_root: String,
}

impl Notifier {
    pub fn new(stream: Arc<dyn DurableStream>, static_root: impl Into<String>) -> Self {
        Self {
            stream,
            static_root: static_root.into(),
        }
    }

    /// Publish the event for a finished job. Jobs without a processed image
    /// produce no event and `Ok(None)`.
    pub async fn publish(&self, job: &Job) -> Result<Option<EntryId>, StreamError> {
        let Some(processed_filename) = job.processed_filename.as_deref() else {
            return Ok(None);
        };

        let event = NotificationEvent::new(job.id, &self.static_root, processed_filename);
        let entry_id = self.stream.append(&codec::encode(&event)?).await?;

        metrics::counter!("face_notifications_published_total").increment(1);
        tracing::debug!(job_id = %job.id, entry_id = %entry_id, "Notification published");
        Ok(Some(entry_id))
    }
}

/// One live connection's view of the notification stream.
pub struct Listener {
    connection_id: String,
    stream: Arc<dyn DurableStream>,
    cursor: EntryId,
    block: Duration,
}

impl Listener {
    /// Start listening from the stream's current tail; earlier events are
    /// not replayed.
    pub async fn open(
        stream: Arc<dyn DurableStream>,
        connection_id: impl Into<String>,
        block: Duration,
    ) -> Result<Self, StreamError> {
        let cursor = stream.last_id().await?;
        Ok(Self {
            connection_id: connection_id.into(),
            stream,
            cursor,
            block,
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn cursor(&self) -> EntryId {
        self.cursor
    }

    /// Read the next event after the cursor, if any.
    ///
    /// Any returned entry advances the cursor; entries that do not decode as
    /// events are skipped with a warning.
    pub async fn poll(&mut self) -> Result<Option<Notification>, StreamError> {
        let Some(entry) = self.stream.tail(self.cursor, self.block).await? else {
            return Ok(None);
        };
        self.cursor = entry.id;

        match codec::decode::<NotificationEvent>(&entry.payload) {
            Ok(event) => Ok(Some(Notification::for_connection(&self.connection_id, event))),
            Err(e) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    entry_id = %entry.id,
                    error = %e,
                    "Skipping malformed notification"
                );
                Ok(None)
            }
        }
    }
}
