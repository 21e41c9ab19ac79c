use std::time::Duration;

use async_trait::async_trait;
use common::CorrelationId;

use crate::{EventEnvelope, Result};

/// Settings shared by every event log backend.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Number of partitions. Fixed for the lifetime of a log.
    pub partitions: u32,
    /// How long a partition stays assigned to a member without a poll.
    pub lease_ttl: Duration,
    /// Upper bound on partitions one member may own. `None` means all.
    pub max_partitions_per_member: Option<u32>,
    /// Backoff between empty fetches while a poll waits for records.
    pub poll_interval: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            partitions: 8,
            lease_ttl: Duration::from_secs(30),
            max_partitions_per_member: None,
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl LogConfig {
    /// Returns how many partitions a single member may hold.
    pub fn member_cap(&self) -> u32 {
        self.max_partitions_per_member
            .unwrap_or(self.partitions)
            .min(self.partitions)
    }
}

/// Position of a record in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogPosition {
    pub partition: u32,
    pub offset: u64,
}

impl std::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// A record delivered to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub position: LogPosition,
    pub envelope: EventEnvelope,
}

/// Maps a correlation id onto a partition.
///
/// FNV-1a over the UUID bytes: stable across processes and restarts, so
/// every event of one lifecycle lands on the same partition.
pub fn partition_for(correlation_id: CorrelationId, partitions: u32) -> u32 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let hash = correlation_id
        .as_uuid()
        .as_bytes()
        .iter()
        .fold(FNV_OFFSET, |hash, byte| {
            (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
        });

    (hash % u64::from(partitions.max(1))) as u32
}

/// An append-only, partitioned log with consumer-group semantics.
///
/// Delivery is at-least-once: a record is redelivered until its consumer
/// group commits past it. Within a group each partition is leased to one
/// member at a time; a lease that is not renewed by polling expires and
/// the partition moves to another member, which resumes from the last
/// committed offset.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends an event to the partition owning its correlation id.
    async fn publish(&self, envelope: &EventEnvelope) -> Result<LogPosition>;

    /// Fetches uncommitted records for `member` of `group`.
    ///
    /// Claims free or expired partitions, renews the member's own leases,
    /// and blocks until at least one record is available or `timeout`
    /// elapses. Records of one partition come back in offset order.
    async fn poll(
        &self,
        group: &str,
        member: &str,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<LogRecord>>;

    /// Marks `record` (and everything before it in its partition) consumed
    /// and renews the member's lease on the partition for another ttl.
    ///
    /// Fails with `LeaseLost` if the member no longer owns the partition.
    async fn commit(&self, group: &str, member: &str, record: &LogRecord) -> Result<()>;

    /// Releases every partition lease held by `member`.
    async fn release(&self, group: &str, member: &str) -> Result<()>;

    /// Returns the number of partitions.
    fn partitions(&self) -> u32;
}
