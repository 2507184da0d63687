//! Stream-backed job dispatch.
//!
//! Consumer-group reader over the request stream with at-least-once delivery:
//! entries stay pending until acknowledged, and entries idle past the reclaim
//! threshold (a crashed worker's) are claimable by any consumer.

use tracing::{info, warn};

use crate::Result;
use crate::coord::CoordStore;
use crate::domain::RunRequest;

/// Default idle threshold before a pending entry is reclaimable.
pub const DEFAULT_RECLAIM_IDLE_MS: u64 = 60_000;

/// Batch size for reads and reclaims.
const READ_COUNT: usize = 8;

/// A decoded entry handed to a worker. `entry_id` must be acknowledged once
/// the run reaches a terminal state and is archived.
#[derive(Debug, Clone)]
pub struct QueuedRun {
    pub entry_id: String,
    pub request: RunRequest,
}

/// Consumer-group dispatcher over the request stream.
#[derive(Clone)]
pub struct RequestQueue {
    coord: CoordStore,
    stream: String,
    group: String,
}

impl RequestQueue {
    pub fn new(coord: CoordStore, stream: &str, group: &str) -> Self {
        Self {
            coord,
            stream: stream.to_string(),
            group: group.to_string(),
        }
    }

    /// Idempotently create the consumer group at the stream tail.
    pub async fn ensure_group(&self) -> Result<()> {
        self.coord.ensure_group(&self.stream, &self.group).await
    }

    /// Append a submission; returns the stream entry id.
    pub async fn submit(&self, request: &RunRequest) -> Result<String> {
        let entry_id = self.coord.xadd(&self.stream, &request.to_fields()?).await?;
        info!(
            run_id = %request.run_id,
            subject_id = %request.subject_id,
            entry_id = %entry_id,
            "Run submitted to request stream"
        );
        Ok(entry_id)
    }

    /// Blocking multi-read of new entries for `consumer`. Malformed entries
    /// are acknowledged and dropped so one poison submission cannot wedge the
    /// group.
    pub async fn read(
        &self,
        consumer: &str,
        block_ms: u64,
    ) -> Result<Vec<QueuedRun>> {
        let entries = self
            .coord
            .xread_group(&self.stream, &self.group, consumer, READ_COUNT, block_ms)
            .await?;
        self.decode(entries).await
    }

    /// Claim entries whose consumer went quiet for at least `min_idle_ms`.
    pub async fn reclaim_idle(
        &self,
        consumer: &str,
        min_idle_ms: u64,
    ) -> Result<Vec<QueuedRun>> {
        let entries = self
            .coord
            .xautoclaim(&self.stream, &self.group, consumer, min_idle_ms, READ_COUNT)
            .await?;
        if !entries.is_empty() {
            info!(count = entries.len(), consumer = %consumer, "Reclaimed idle stream entries");
        }
        self.decode(entries).await
    }

    /// Remove an entry from the pending list. Only called on terminal run
    /// outcomes.
    pub async fn ack(&self, entry_id: &str) -> Result<()> {
        self.coord.xack(&self.stream, &self.group, entry_id).await
    }

    async fn decode(&self, entries: Vec<crate::coord::StreamEntry>) -> Result<Vec<QueuedRun>> {
        let mut decoded = Vec::with_capacity(entries.len());
        for entry in entries {
            match RunRequest::from_fields(&entry.fields) {
                Ok(request) => decoded.push(QueuedRun {
                    entry_id: entry.id,
                    request,
                }),
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %e, "Dropping malformed stream entry");
                    self.ack(&entry.id).await?;
                }
            }
        }
        Ok(decoded)
    }
}
