use crate::backend::{BackendError, SharedBackend};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Position of one subscription in the backend, shared by all of its deliveries
pub(super) struct DeliveryCursor {
    pub(super) backend: SharedBackend,
    pub(super) stream: String,
    pub(super) group: String,
}

/// Capability to settle a single delivered entry
///
/// Settling consumes the handle, so an entry can be acknowledged at most once through it.
/// Dropping the handle without settling has the same effect as [`nack`](Self::nack).
pub struct DeliveryHandle {
    cursor: Arc<DeliveryCursor>,
    entry_id: String,
}

impl DeliveryHandle {
    pub(super) fn new(cursor: Arc<DeliveryCursor>, entry_id: String) -> Self {
        Self { cursor, entry_id }
    }

    /// Sequence token of the entry this handle settles
    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    /// Removes the entry from the pending list of the group.
    /// Returns `false` if it was not pending anymore, e.g. because it had been acknowledged before.
    pub async fn ack(self) -> Result<bool, BackendError> {
        let acknowledged = self
            .cursor
            .backend
            .acknowledge(
                &self.cursor.stream,
                &self.cursor.group,
                &[self.entry_id.clone()],
            )
            .await?;

        trace!(entry = %self.entry_id, "Acknowledged entry");

        Ok(acknowledged > 0)
    }

    /// Leaves the entry pending so that it can be delivered again
    pub fn nack(self) {
        trace!(entry = %self.entry_id, "Left entry pending");
    }
}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("stream", &self.cursor.stream)
            .field("group", &self.cursor.group)
            .field("entry_id", &self.entry_id)
            .finish()
    }
}
