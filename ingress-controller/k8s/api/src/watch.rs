use futures::prelude::*;
pub use kube::runtime::watcher::{Event, Result};
use std::{pin::Pin, time::Duration};
use tokio::time;
use tracing::{info, Instrument};

type EventStream<T> = Pin<Box<dyn Stream<Item = Result<Event<T>>> + Send + 'static>>;

/// Wraps a watch stream so that errors never surface to the consumer.
///
/// Errors are logged and followed by a backoff. The backoff is held on the watch so that a
/// canceled `recv` resumes waiting instead of polling the failed stream immediately.
pub struct Watch<T> {
    rx: EventStream<T>,
    backoff: Duration,
    pending: Option<Pin<Box<time::Sleep>>>,
    span: tracing::Span,
}

/// Wraps `watch` in a [`Watch`] that retries every second.
pub fn resilient<T, W>(watch: W) -> Watch<T>
where
    W: Stream<Item = Result<Event<T>>> + Send + 'static,
{
    Watch {
        rx: watch.boxed(),
        backoff: Duration::from_secs(1),
        pending: None,
        span: tracing::Span::current(),
    }
}

// === impl Watch ===

impl<T> Watch<T> {
    pub fn instrument(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Receives the next event, or `None` if the underlying stream ended.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        loop {
            if let Some(sleep) = self.pending.as_mut() {
                sleep.await;
                self.pending = None;
                info!(parent: &self.span, "Restarting");
            }

            match self.rx.next().instrument(self.span.clone()).await? {
                Ok(ev) => return Some(ev),
                Err(error) => {
                    info!(parent: &self.span, %error, "Watch failed");
                    self.pending = Some(Box::pin(time::sleep(self.backoff)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn skips_errors() {
        let events: Vec<Result<Event<String>>> = vec![
            Err(kube::runtime::watcher::Error::NoResourceVersion),
            Ok(Event::Apply("cafe".to_string())),
        ];
        let mut watch = resilient(stream::iter(events));
        match watch.recv().await {
            Some(Event::Apply(value)) => assert_eq!(value, "cafe"),
            _ => panic!("expected an apply event"),
        }
        assert!(watch.recv().await.is_none());
    }
}
