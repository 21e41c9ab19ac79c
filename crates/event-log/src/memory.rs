use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;

use crate::{
    EventEnvelope, EventId, EventLog, EventLogError, LogConfig, LogPosition, LogRecord,
    OutboxEntry, OutboxStore, Result, partition_for,
};

#[derive(Debug)]
struct Lease {
    member: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LogState {
    partitions: Vec<Vec<EventEnvelope>>,
    /// Next offset to deliver, per (group, partition).
    offsets: HashMap<(String, u32), u64>,
    leases: HashMap<(String, u32), Lease>,
}

impl LogState {
    /// Renews the member's leases and claims free ones up to `cap`.
    /// Returns the partitions the member owns afterwards.
    fn claim(&mut self, group: &str, member: &str, cap: u32, ttl: Duration) -> Vec<u32> {
        let now = Instant::now();
        let partitions = self.partitions.len() as u32;
        let mut owned = Vec::new();

        for partition in 0..partitions {
            if let Some(lease) = self.leases.get_mut(&(group.to_string(), partition))
                && lease.member == member
                && lease.expires_at > now
            {
                lease.expires_at = now + ttl;
                owned.push(partition);
            }
        }

        for partition in 0..partitions {
            if owned.len() as u32 >= cap {
                break;
            }
            let key = (group.to_string(), partition);
            let free = match self.leases.get(&key) {
                None => true,
                Some(lease) => lease.expires_at <= now,
            };
            if free {
                self.leases.insert(
                    key,
                    Lease {
                        member: member.to_string(),
                        expires_at: now + ttl,
                    },
                );
                owned.push(partition);
            }
        }

        owned.sort_unstable();
        owned
    }

    /// Extends the member's live lease on `partition`. Returns false when
    /// the lease expired or belongs to someone else.
    fn renew(&mut self, group: &str, member: &str, partition: u32, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.leases.get_mut(&(group.to_string(), partition)) {
            Some(lease) if lease.member == member && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }
}

/// In-memory event log for tests and single-process runs.
///
/// Implements the same partition, offset and lease semantics as the
/// PostgreSQL log, without durability across restarts.
#[derive(Clone)]
pub struct InMemoryEventLog {
    state: Arc<Mutex<LogState>>,
    notify: Arc<Notify>,
    config: LogConfig,
    fail_on_publish: Arc<AtomicBool>,
}

impl InMemoryEventLog {
    /// Creates an empty log.
    pub fn new(config: LogConfig) -> Self {
        let partitions = config.partitions.max(1) as usize;
        let state = LogState {
            partitions: vec![Vec::new(); partitions],
            ..LogState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            notify: Arc::new(Notify::new()),
            config,
            fail_on_publish: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes every publish fail until reset.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Returns the total number of records across partitions.
    pub async fn record_count(&self) -> usize {
        self.state
            .lock()
            .await
            .partitions
            .iter()
            .map(Vec::len)
            .sum()
    }

    /// Returns every record of the given type, in partition then offset order.
    pub async fn records_of_type(&self, event_type: &str) -> Vec<EventEnvelope> {
        self.state
            .lock()
            .await
            .partitions
            .iter()
            .flatten()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Returns the member currently holding a partition, if any.
    pub async fn lease_holder(&self, group: &str, partition: u32) -> Option<String> {
        let state = self.state.lock().await;
        state
            .leases
            .get(&(group.to_string(), partition))
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.member.clone())
    }

    fn fetch(state: &LogState, group: &str, owned: &[u32], max_records: usize) -> Vec<LogRecord> {
        let mut records = Vec::new();
        for &partition in owned {
            let next = state
                .offsets
                .get(&(group.to_string(), partition))
                .copied()
                .unwrap_or(0);
            let log = &state.partitions[partition as usize];
            for (offset, envelope) in log.iter().enumerate().skip(next as usize) {
                if records.len() >= max_records {
                    return records;
                }
                records.push(LogRecord {
                    position: LogPosition {
                        partition,
                        offset: offset as u64,
                    },
                    envelope: envelope.clone(),
                });
            }
        }
        records
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<LogPosition> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(EventLogError::Publish("log unavailable".to_string()));
        }

        let partition = partition_for(envelope.correlation_id, self.config.partitions.max(1));
        let position = {
            let mut state = self.state.lock().await;
            let log = &mut state.partitions[partition as usize];
            log.push(envelope.clone());
            LogPosition {
                partition,
                offset: (log.len() - 1) as u64,
            }
        };
        self.notify.notify_waiters();
        Ok(position)
    }

    async fn poll(
        &self,
        group: &str,
        member: &str,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<LogRecord>> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                let owned = state.claim(group, member, self.config.member_cap(), self.config.lease_ttl);
                let records = Self::fetch(&state, group, &owned, max_records);
                if !records.is_empty() {
                    return Ok(records);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wait = (deadline - now).min(self.config.poll_interval);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn commit(&self, group: &str, member: &str, record: &LogRecord) -> Result<()> {
        let partition = record.position.partition;
        let mut state = self.state.lock().await;
        if !state.renew(group, member, partition, self.config.lease_ttl) {
            return Err(EventLogError::LeaseLost {
                group: group.to_string(),
                partition,
            });
        }

        let next = state
            .offsets
            .entry((group.to_string(), partition))
            .or_insert(0);
        *next = (*next).max(record.position.offset + 1);
        Ok(())
    }

    async fn release(&self, group: &str, member: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .leases
            .retain(|(g, _), lease| !(g == group && lease.member == member));
        Ok(())
    }

    fn partitions(&self) -> u32 {
        self.config.partitions.max(1)
    }
}

/// In-memory outbox for tests and single-process runs.
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    entries: Arc<RwLock<HashMap<EventId, OutboxEntry>>>,
}

impl InMemoryOutbox {
    /// Creates an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if the outbox holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn insert(&self, envelope: &EventEnvelope) -> Result<bool> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&envelope.event_id) {
            return Ok(false);
        }
        entries.insert(envelope.event_id, OutboxEntry::new(envelope.clone()));
        Ok(true)
    }

    async fn mark_published(&self, event_id: EventId) -> Result<()> {
        if let Some(entry) = self.entries.write().await.get_mut(&event_id) {
            entry.published_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn record_failure(&self, event_id: EventId, error: &str) -> Result<()> {
        if let Some(entry) = self.entries.write().await.get_mut(&event_id) {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn pending(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>> {
        let entries = self.entries.read().await;
        let mut pending: Vec<_> = entries
            .values()
            .filter(|e| !e.is_published() && e.created_at <= before)
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn get(&self, event_id: EventId) -> Result<Option<OutboxEntry>> {
        Ok(self.entries.read().await.get(&event_id).cloned())
    }
}
