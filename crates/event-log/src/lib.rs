//! Partitioned event log, outbox, and idempotent emitter.
//!
//! This crate provides the transport side of the fulfillment pipeline:
//! - [`EventEnvelope`], the stable JSON envelope every event travels in
//! - [`EventLog`], an append-only partitioned log with consumer groups
//! - [`OutboxStore`], the durable record of emission intents
//! - [`IdempotentEmitter`], which persists an event before publishing it
//!
//! Each storage trait has an in-memory and a PostgreSQL implementation.

pub mod emitter;
pub mod error;
pub mod event;
pub mod log;
pub mod memory;
pub mod outbox;
pub mod postgres;

pub use emitter::{EmitOutcome, IdempotentEmitter, SweepReport};
pub use error::{EventLogError, Result, is_transient_sqlx};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, EventType, SCHEMA_VERSION};
pub use log::{EventLog, LogConfig, LogPosition, LogRecord, partition_for};
pub use memory::{InMemoryEventLog, InMemoryOutbox};
pub use outbox::{OutboxEntry, OutboxStore};
pub use postgres::{PostgresEventLog, PostgresOutbox};
