//! Handler doubles.
//!
//! - [`RecordingHandler`]: always succeeds, remembers every message
//! - [`ScriptedHandler`]: plays back a list of results, then a fallback

use marketplace_events_core::handler::{EventHandler, HandlerError, HandlerFuture};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Succeeds and records each message. Clones share the record.
#[derive(Debug)]
pub struct RecordingHandler<M> {
    name: &'static str,
    received: Arc<Mutex<Vec<M>>>,
}

impl<M> RecordingHandler<M> {
    /// Handler reporting `name`.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Messages received so far.
    #[must_use]
    pub fn received(&self) -> Vec<M>
    where
        M: Clone,
    {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of messages received.
    #[must_use]
    pub fn count(&self) -> usize {
        self.received.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<M> Clone for RecordingHandler<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            received: Arc::clone(&self.received),
        }
    }
}

impl<M> EventHandler<M> for RecordingHandler<M>
where
    M: Clone + Send + Sync,
{
    fn handle<'a>(&'a self, message: &'a M, _cancel: &'a CancellationToken) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.received
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(message.clone());
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Returns scripted results in order, then `fallback` forever.
///
/// ```
/// use marketplace_events_core::handler::{EventHandler, HandlerError};
/// use marketplace_events_testing::ScriptedHandler;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() {
/// let handler = ScriptedHandler::new("flaky", [Err(HandlerError::timeout("slow"))]);
/// let cancel = CancellationToken::new();
///
/// assert!(handler.handle(&1_u32, &cancel).await.is_err());
/// assert!(handler.handle(&2_u32, &cancel).await.is_ok());
/// assert_eq!(handler.invocations(), 2);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ScriptedHandler {
    name: &'static str,
    script: Arc<Mutex<VecDeque<Result<(), HandlerError>>>>,
    fallback: Result<(), HandlerError>,
    invocations: Arc<AtomicUsize>,
}

impl ScriptedHandler {
    /// Handler playing back `script`, then succeeding.
    pub fn new<I>(name: &'static str, script: I) -> Self
    where
        I: IntoIterator<Item = Result<(), HandlerError>>,
    {
        Self {
            name,
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            fallback: Ok(()),
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Handler that always fails with `error`.
    #[must_use]
    pub fn always_failing(name: &'static str, error: HandlerError) -> Self {
        Self::new(name, []).then_always(Err(error))
    }

    /// Result returned once the script is exhausted.
    #[must_use]
    pub fn then_always(mut self, result: Result<(), HandlerError>) -> Self {
        self.fallback = result;
        self
    }

    /// Times the handler ran.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl<M: Sync> EventHandler<M> for ScriptedHandler {
    fn handle<'a>(&'a self, _message: &'a M, _cancel: &'a CancellationToken) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_handler_shares_record_between_clones() {
        let handler = RecordingHandler::<String>::new("recorder");
        let clone = handler.clone();
        let cancel = CancellationToken::new();

        clone.handle(&"a".to_string(), &cancel).await.unwrap();
        clone.handle(&"b".to_string(), &cancel).await.unwrap();

        assert_eq!(handler.received(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(EventHandler::<String>::name(&handler), "recorder");
    }

    #[tokio::test]
    async fn scripted_handler_falls_back_after_script() {
        let handler = ScriptedHandler::new("scripted", [Err(HandlerError::io("reset")), Ok(())])
            .then_always(Err(HandlerError::validation("stop")));
        let cancel = CancellationToken::new();

        assert_eq!(handler.handle(&(), &cancel).await.unwrap_err().kind(), "Io");
        assert!(handler.handle(&(), &cancel).await.is_ok());
        assert_eq!(handler.handle(&(), &cancel).await.unwrap_err().kind(), "Validation");
        assert_eq!(handler.handle(&(), &cancel).await.unwrap_err().kind(), "Validation");
        assert_eq!(handler.invocations(), 4);
    }
}
