//! # Marketplace Messaging
//!
//! Host-side wiring for the marketplace messaging core: environment driven
//! configuration and the factory that picks a transport for it.
//!
//! ```no_run
//! use marketplace_messaging::{MessageBusFactory, MessagingConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = MessageBusFactory::new(MessagingConfig::from_env()?);
//! let bus = factory.create_message_bus().await?;
//! let sink = factory.create_dead_letter_sink(bus.clone()).await?;
//! let middleware = factory.retry_middleware(sink);
//! # let _ = middleware;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Environment configuration
pub mod config;

/// Transport selection and component wiring
pub mod factory;

pub use config::{ConfigError, HostEnvironment, MessagingConfig, RedisConfig, RedpandaConfig};
pub use factory::{FactoryError, MessageBusFactory, TransportKind, select_transport};
