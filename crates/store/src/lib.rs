//! Durable fulfillment state.
//!
//! [`FulfillmentStore`] covers purchases, allocations, sessions, the
//! processed-events ledger and dead letters. It is the single source of
//! truth of the pipeline and the only place mutual exclusion is enforced.
//!
//! Implementations:
//! - [`InMemoryFulfillmentStore`] for tests
//! - [`PostgresFulfillmentStore`] backed by the `migrations/` schema

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::InMemoryFulfillmentStore;
pub use postgres::PostgresFulfillmentStore;
pub use store::{DeadLetter, FulfillmentStore, NewDeadLetter, WindowOutcome};
