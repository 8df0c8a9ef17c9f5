//! `PostgreSQL` dead letter store for the marketplace messaging core.
//!
//! [`PostgresDeadLetterStore`] implements the runtime's `DeadLetterSink`, so
//! the retry middleware can persist permanently failed messages. The table
//! doubles as an operations queue:
//!
//! - list pending failures for investigation
//! - move entries through `processing` → `resolved` / `discarded`
//! - count pending entries for health checks
//!
//! # Example
//!
//! ```ignore
//! use marketplace_events_postgres::PostgresDeadLetterStore;
//! use marketplace_events_runtime::prelude::*;
//!
//! let store = PostgresDeadLetterStore::connect(&database_url).await?;
//! store.ensure_schema().await?;
//!
//! let policy = DeadLetterService::new(DeadLetterPolicyOptions::default(), Arc::new(store));
//! let middleware = RetryMiddleware::new(Arc::new(policy));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Durable dead letter storage
pub mod dead_letter_store;

pub use dead_letter_store::{PostgresDeadLetterStore, SCHEMA, TABLE};
