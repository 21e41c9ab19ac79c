//! The fulfillment pipeline stages.
//!
//! Each stage is an [`EventHandler`] run by a [`StageConsumer`] in its own
//! consumer group:
//!
//! ```text
//! PurchaseConfirmed -> PurchaseMaterializer  -> PurchaseCreated
//! PurchaseCreated   -> AllocationCoordinator -> TrainerAllocated
//! TrainerAllocated  -> SessionScheduler      -> SessionsGenerated
//! PurchaseCreated | TrainerAllocated | SessionsGenerated -> CacheInvalidator
//! ```
//!
//! The [`Dispatcher`] wraps every stage with its retry budget and sends
//! exhausted events to the dead-letter sink, from where
//! [`DeadLetterReplayer`] puts them back on the log.

pub mod allocator;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod invalidator;
pub mod materializer;
pub mod replay;
pub mod retry;
pub mod scheduler;
pub mod services;
pub mod timers;

pub use allocator::{ALLOCATOR_STAGE, AllocationCoordinator};
pub use consumer::{ConsumerConfig, StageConsumer};
pub use error::{PipelineError, Result};
pub use handler::{Dispatcher, Disposition, EventHandler, HandleOutcome};
pub use invalidator::{CacheInvalidator, INVALIDATOR_STAGE};
pub use materializer::{MATERIALIZER_STAGE, PurchaseMaterializer};
pub use replay::DeadLetterReplayer;
pub use retry::{RetryFailure, RetryPolicy, retry_with_backoff};
pub use scheduler::{SCHEDULER_STAGE, SchedulerConfig, SessionScheduler, TopUpReport};
pub use services::{
    CacheStore, HttpTutorMatcher, InMemoryCacheStore, InMemoryTutorMatcher, MatchRequest,
    RedisCacheStore, TutorMatcher,
};
pub use timers::{spawn_republish_timer, spawn_top_up_timer};
