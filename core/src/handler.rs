//! Handler contract shared by the dispatcher, the domain event processor and
//! the retry middleware.
//!
//! A handler receives a borrowed message and a [`CancellationToken`] and
//! returns a boxed future. Explicit `Pin<Box<dyn Future>>` returns keep the
//! trait object-safe, so registries can hold `Arc<dyn EventHandler<M>>`.

use crate::message_bus::MessageBusError;
use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Well-known failure kinds.
///
/// The dead letter policy classifies failures by these names; the configured
/// retryable / non-retryable lists refer to them.
pub mod kinds {
    /// A caller passed an invalid argument.
    pub const INVALID_ARGUMENT: &str = "InvalidArgument";
    /// The message failed validation.
    pub const VALIDATION: &str = "Validation";
    /// A business rule rejected the operation.
    pub const BUSINESS_RULE: &str = "BusinessRule";
    /// The message could not be (de)serialized.
    pub const SERIALIZATION: &str = "Serialization";
    /// An operation timed out.
    pub const TIMEOUT: &str = "Timeout";
    /// Transient I/O failure.
    pub const IO: &str = "Io";
    /// The message broker reported an error.
    pub const BROKER: &str = "Broker";
    /// Handler was cancelled.
    pub const CANCELLED: &str = "Cancelled";
    /// The handler panicked. Never retried.
    pub const PANIC: &str = "Panic";
}

/// Failure reported by a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler observed the cancellation signal.
    ///
    /// Never retried and never dead-lettered.
    #[error("handler cancelled")]
    Cancelled,

    /// Any other failure, classified by `kind`.
    #[error("{kind}: {message}")]
    Failed {
        /// Failure kind used for retry classification (see [`kinds`]).
        kind: String,
        /// Human-readable description.
        message: String,
    },
}

impl HandlerError {
    /// Failure of an arbitrary kind.
    pub fn other(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Invalid argument (non-retryable by default).
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::other(kinds::INVALID_ARGUMENT, message)
    }

    /// Validation failure (non-retryable by default).
    pub fn validation(message: impl Into<String>) -> Self {
        Self::other(kinds::VALIDATION, message)
    }

    /// Business rule violation (non-retryable by default).
    pub fn business_rule(message: impl Into<String>) -> Self {
        Self::other(kinds::BUSINESS_RULE, message)
    }

    /// Serialization failure (non-retryable by default).
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::other(kinds::SERIALIZATION, message)
    }

    /// Timeout (retryable by default).
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::other(kinds::TIMEOUT, message)
    }

    /// Transient I/O failure (retryable by default).
    pub fn io(message: impl Into<String>) -> Self {
        Self::other(kinds::IO, message)
    }

    /// Broker failure (retryable by default).
    pub fn broker(message: impl Into<String>) -> Self {
        Self::other(kinds::BROKER, message)
    }

    /// Failure standing in for a caught handler panic.
    #[must_use]
    pub fn panicked(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::other(kinds::PANIC, message)
    }

    /// The failure kind name.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Cancelled => kinds::CANCELLED,
            Self::Failed { kind, .. } => kind,
        }
    }

    /// Whether this stands in for a handler panic.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        self.kind() == kinds::PANIC
    }

    /// Whether this is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<MessageBusError> for HandlerError {
    fn from(err: MessageBusError) -> Self {
        match err {
            MessageBusError::SerializationFailed(_) | MessageBusError::DeserializationFailed(_) => {
                Self::serialization(err.to_string())
            },
            _ => Self::broker(err.to_string()),
        }
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(err.to_string())
        } else {
            Self::io(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for HandlerError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::timeout(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

/// Future returned by [`EventHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Something that reacts to messages of type `M`.
///
/// Handlers should observe `cancel` and return [`HandlerError::Cancelled`]
/// when it fires.
///
/// # Example
///
/// ```
/// use marketplace_events_core::handler::{EventHandler, HandlerFuture};
/// use tokio_util::sync::CancellationToken;
///
/// struct LogWelcome;
///
/// impl EventHandler<String> for LogWelcome {
///     fn handle<'a>(
///         &'a self,
///         message: &'a String,
///         _cancel: &'a CancellationToken,
///     ) -> HandlerFuture<'a> {
///         Box::pin(async move {
///             println!("welcome {message}");
///             Ok(())
///         })
///     }
/// }
/// ```
pub trait EventHandler<M>: Send + Sync {
    /// Handle one message.
    fn handle<'a>(&'a self, message: &'a M, cancel: &'a CancellationToken) -> HandlerFuture<'a>;

    /// Handler identity used in logs and dead-letter records.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl<M, H> EventHandler<M> for Arc<H>
where
    H: EventHandler<M> + ?Sized,
{
    fn handle<'a>(&'a self, message: &'a M, cancel: &'a CancellationToken) -> HandlerFuture<'a> {
        (**self).handle(message, cancel)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Adapter turning a closure into an [`EventHandler`].
///
/// The closure receives an owned clone of the message so the returned future
/// can be `'static`.
pub struct FnHandler<M, F> {
    name: &'static str,
    f: F,
    _message: PhantomData<fn(M)>,
}

impl<M, F, Fut> FnHandler<M, F>
where
    M: Clone + Send + Sync,
    F: Fn(M, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    /// Wrap `f` under the given handler name.
    pub const fn new(name: &'static str, f: F) -> Self {
        Self {
            name,
            f,
            _message: PhantomData,
        }
    }
}

impl<M, F, Fut> EventHandler<M> for FnHandler<M, F>
where
    M: Clone + Send + Sync,
    F: Fn(M, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle<'a>(&'a self, message: &'a M, cancel: &'a CancellationToken) -> HandlerFuture<'a> {
        Box::pin((self.f)(message.clone(), cancel.clone()))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Build a handler from a closure.
///
/// ```
/// use marketplace_events_core::handler::{handler_fn, EventHandler};
///
/// let handler = handler_fn("noop", |_message: u32, _cancel| async { Ok(()) });
/// assert_eq!(EventHandler::<u32>::name(&handler), "noop");
/// ```
pub const fn handler_fn<M, F, Fut>(name: &'static str, f: F) -> FnHandler<M, F>
where
    M: Clone + Send + Sync,
    F: Fn(M, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler::new(name, f)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_follow_constructor() {
        assert_eq!(HandlerError::validation("bad email").kind(), kinds::VALIDATION);
        assert_eq!(HandlerError::timeout("slow").kind(), kinds::TIMEOUT);
        assert_eq!(HandlerError::Cancelled.kind(), kinds::CANCELLED);
        assert!(HandlerError::Cancelled.is_cancelled());
        assert!(!HandlerError::io("reset").is_cancelled());
    }

    #[test]
    fn panic_payloads_keep_their_message() {
        let from_str: Box<dyn Any + Send> = Box::new("boom");
        let from_string: Box<dyn Any + Send> = Box::new(format!("bad rating {}", 1));
        let opaque: Box<dyn Any + Send> = Box::new(42_u8);

        assert_eq!(
            HandlerError::panicked(from_str.as_ref()),
            HandlerError::other(kinds::PANIC, "boom")
        );
        assert_eq!(
            HandlerError::panicked(from_string.as_ref()).to_string(),
            "Panic: bad rating 1"
        );
        assert!(HandlerError::panicked(opaque.as_ref()).is_panic());
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = HandlerError::business_rule("provider already hired");
        assert_eq!(err.to_string(), "BusinessRule: provider already hired");
    }

    #[test]
    fn io_timeouts_map_to_timeout_kind() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline");
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");

        assert_eq!(HandlerError::from(timed_out).kind(), kinds::TIMEOUT);
        assert_eq!(HandlerError::from(reset).kind(), kinds::IO);
    }

    #[test]
    fn bus_errors_map_to_broker_or_serialization() {
        let publish = MessageBusError::PublishFailed {
            destination: "users-events".to_string(),
            reason: "leader not available".to_string(),
        };
        let decode = MessageBusError::DeserializationFailed("eof".to_string());

        assert_eq!(HandlerError::from(publish).kind(), kinds::BROKER);
        assert_eq!(HandlerError::from(decode).kind(), kinds::SERIALIZATION);
    }

    #[tokio::test]
    async fn closure_handler_receives_message() {
        let handler = handler_fn("reject-odd", |n: u32, _cancel| async move {
            if n % 2 == 0 {
                Ok(())
            } else {
                Err(HandlerError::validation(format!("{n} is odd")))
            }
        });
        let cancel = CancellationToken::new();

        assert!(handler.handle(&2, &cancel).await.is_ok());
        let err = handler.handle(&3, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), kinds::VALIDATION);
    }

    #[tokio::test]
    async fn arc_handler_delegates_name() {
        let inner = handler_fn("shared", |_: u8, _cancel| async { Ok(()) });
        let shared: Arc<dyn EventHandler<u8>> = Arc::new(inner);

        assert_eq!(shared.name(), "shared");
        assert!(shared.handle(&1, &CancellationToken::new()).await.is_ok());
    }
}
