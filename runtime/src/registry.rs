//! Typed handler registry.
//!
//! Handlers are registered per concrete event type at startup and stored
//! type-erased, keyed by [`TypeId`]. At dispatch time the event's runtime type
//! selects the handler list and each handler downcasts the event back to its
//! concrete type. Only exact types match: a handler for `A` never sees `B`.

use marketplace_events_core::event::Event;
use marketplace_events_core::handler::{EventHandler, HandlerError, HandlerFuture};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A handler whose event type has been erased.
pub trait ErasedHandler: Send + Sync {
    /// Handler name for logs.
    fn name(&self) -> &'static str;

    /// Short name of the event type the handler was registered for.
    fn event_type(&self) -> &'static str;

    /// Invoke the handler. Fails with a `TypeMismatch` error if `event` is
    /// not the registered type.
    fn handle_any<'a>(&'a self, event: &'a dyn Any, cancel: &'a CancellationToken)
    -> HandlerFuture<'a>;
}

struct Typed<E, H> {
    handler: H,
    _event: PhantomData<fn(&E)>,
}

impl<E, H> ErasedHandler for Typed<E, H>
where
    E: Event,
    H: EventHandler<E>,
{
    fn name(&self) -> &'static str {
        self.handler.name()
    }

    fn event_type(&self) -> &'static str {
        marketplace_events_core::event::short_type_name(std::any::type_name::<E>())
    }

    fn handle_any<'a>(
        &'a self,
        event: &'a dyn Any,
        cancel: &'a CancellationToken,
    ) -> HandlerFuture<'a> {
        match event.downcast_ref::<E>() {
            Some(event) => self.handler.handle(event, cancel),
            None => {
                let expected = self.event_type();
                Box::pin(async move {
                    Err(HandlerError::other(
                        "TypeMismatch",
                        format!("handler expects {expected}"),
                    ))
                })
            },
        }
    }
}

/// Event type → handlers.
///
/// Built once, then shared read-only as `Arc<HandlerRegistry>`.
///
/// ```
/// use marketplace_events_core::event::{Event, EventMetadata};
/// use marketplace_events_core::handler::handler_fn;
/// use marketplace_events_runtime::registry::HandlerRegistry;
///
/// #[derive(Debug, Clone)]
/// struct QuoteRequested { metadata: EventMetadata }
///
/// impl Event for QuoteRequested {
///     fn metadata(&self) -> &EventMetadata { &self.metadata }
/// }
///
/// let mut registry = HandlerRegistry::new();
/// let notify = handler_fn("notify-provider", |_e: QuoteRequested, _c| async { Ok(()) });
/// registry.register::<QuoteRequested, _>(notify);
///
/// assert_eq!(registry.handler_count::<QuoteRequested>(), 1);
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TypeId, Vec<Arc<dyn ErasedHandler>>>,
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of type `E`.
    ///
    /// Handlers run in registration order where order matters (the domain
    /// event processor).
    pub fn register<E, H>(&mut self, handler: H) -> &mut Self
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        let erased: Arc<dyn ErasedHandler> = Arc::new(Typed {
            handler,
            _event: PhantomData::<fn(&E)>,
        });

        tracing::debug!(
            event_type = erased.event_type(),
            handler = erased.name(),
            "Registered event handler"
        );

        self.handlers.entry(TypeId::of::<E>()).or_default().push(erased);
        self
    }

    /// Handlers for the runtime type of `event`.
    #[must_use]
    pub fn handlers_for(&self, event: &dyn Any) -> &[Arc<dyn ErasedHandler>] {
        self.handlers
            .get(&event.type_id())
            .map_or(&[][..], Vec::as_slice)
    }

    /// Number of handlers registered for `E`.
    #[must_use]
    pub fn handler_count<E: Event>(&self) -> usize {
        self.handlers.get(&TypeId::of::<E>()).map_or(0, Vec::len)
    }

    /// Whether no handler is registered at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for handlers in self.handlers.values() {
            if let Some(first) = handlers.first() {
                let names: Vec<_> = handlers.iter().map(|h| h.name()).collect();
                map.entry(&first.event_type(), &names);
            }
        }
        map.finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use marketplace_events_core::event::{AsAny, EventMetadata};
    use marketplace_events_core::handler::handler_fn;

    #[derive(Debug, Clone)]
    struct ProviderApproved {
        metadata: EventMetadata,
    }

    impl Event for ProviderApproved {
        fn metadata(&self) -> &EventMetadata {
            &self.metadata
        }
    }

    #[derive(Debug, Clone)]
    struct ProviderSuspended {
        metadata: EventMetadata,
    }

    impl Event for ProviderSuspended {
        fn metadata(&self) -> &EventMetadata {
            &self.metadata
        }
    }

    #[test]
    fn lookup_is_by_exact_runtime_type() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<ProviderApproved, _>(handler_fn("a", |_: ProviderApproved, _| async {
                Ok(())
            }))
            .register::<ProviderApproved, _>(handler_fn("b", |_: ProviderApproved, _| async {
                Ok(())
            }));

        let approved: Box<dyn Event> = Box::new(ProviderApproved {
            metadata: EventMetadata::new(),
        });
        let suspended = ProviderSuspended {
            metadata: EventMetadata::new(),
        };

        let names: Vec<_> = registry
            .handlers_for(approved.as_ref().as_any())
            .iter()
            .map(|h| h.name())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(registry.handlers_for(suspended.as_any()).is_empty());
        assert_eq!(registry.handler_count::<ProviderSuspended>(), 0);
    }

    #[tokio::test]
    async fn mismatched_event_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register::<ProviderApproved, _>(handler_fn("a", |_: ProviderApproved, _| async {
            Ok(())
        }));
        let approved = ProviderApproved {
            metadata: EventMetadata::new(),
        };
        let suspended = ProviderSuspended {
            metadata: EventMetadata::new(),
        };

        let handler = registry.handlers_for(&approved).first().cloned().unwrap();
        let err = handler
            .handle_any(&suspended, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "TypeMismatch");
        assert_eq!(handler.event_type(), "ProviderApproved");
    }
}
