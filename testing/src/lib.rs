//! # Marketplace Events Testing
//!
//! Test doubles for the marketplace messaging core.
//!
//! This crate provides:
//! - [`InMemoryMessageBus`]: process-local bus, also used for the `testing`
//!   environment
//! - [`RecordingHandler`] and [`ScriptedHandler`]: handler doubles
//! - [`fixtures`]: sample events laid out like module-owned events
//!
//! ## Example
//!
//! ```
//! use marketplace_events_core::handler::{EventHandler, HandlerError};
//! use marketplace_events_testing::{ScriptedHandler, fixtures::modules::users::UserRegistered};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let handler = ScriptedHandler::always_failing("mailer", HandlerError::io("smtp down"));
//! let event = UserRegistered::new("ana@example.com");
//!
//! let result = handler.handle(&event, &CancellationToken::new()).await;
//! assert_eq!(result.unwrap_err().kind(), "Io");
//! # }
//! ```

/// Sample events
pub mod fixtures;

/// Handler doubles
pub mod handlers;

/// In-memory message bus
pub mod message_bus;

pub use fixtures::fixed_time;
pub use handlers::{RecordingHandler, ScriptedHandler};
pub use message_bus::{DEFAULT_RECORDING_LIMIT, InMemoryMessageBus};
