//! Drives an upstream feed and restarts it after failures.

use std::sync::Arc;

use futures::StreamExt;
use kube_core::{DynamicObject, WatchEvent};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    event::ChangeKind,
    hub::Hub,
    normalize::Normalizer,
    source::{Selector, SourceError, WatchSource},
};

pub mod backoff;
pub use backoff::{Backoff, BackoffConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    Starting,
    Streaming,
    Backoff,
    /// Only reached through shutdown.
    Terminated,
}

struct WatchSession {
    status: WatchStatus,
    retry_count: u32,
    next_retry_at: Option<Instant>,
}

/// Why a feed stopped streaming.
enum Interrupt {
    Shutdown,
    Ended,
    Failed(SourceError),
}

pub struct Supervisor<S> {
    source: S,
    selector: Selector,
    normalizer: Normalizer,
    hub: Arc<Hub>,
    backoff: Backoff,
    session: WatchSession,
    status: watch::Sender<WatchStatus>,
}

impl<S: WatchSource> Supervisor<S> {
    pub fn new(source: S, selector: Selector, hub: Arc<Hub>, backoff: &BackoffConfig) -> Self {
        let normalizer = Normalizer::for_resource(&selector.resource);
        let (status, _) = watch::channel(WatchStatus::Starting);
        Self {
            source,
            selector,
            normalizer,
            hub,
            backoff: Backoff::new(backoff),
            session: WatchSession {
                status: WatchStatus::Starting,
                retry_count: 0,
                next_retry_at: None,
            },
            status,
        }
    }

    /// Observes status transitions of this supervisor.
    pub fn status(&self) -> watch::Receiver<WatchStatus> {
        self.status.subscribe()
    }

    /// Watches until `shutdown` is cancelled, retrying failed feeds indefinitely.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let collection = self.selector.resource.plural.clone();
        loop {
            self.transition(WatchStatus::Starting);
            let started = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                started = self.source.start_watch(&self.selector) => started,
            };

            let interrupt = match started {
                Ok(feed) => {
                    self.session.retry_count = 0;
                    self.session.next_retry_at = None;
                    self.backoff.reset();
                    self.transition(WatchStatus::Streaming);
                    log::info!("Watching {collection}");
                    self.stream(feed, &shutdown).await
                }
                Err(err) => Interrupt::Failed(err),
            };

            match interrupt {
                Interrupt::Shutdown => break,
                Interrupt::Ended => log::info!("Watch on {collection} ended, restarting"),
                Interrupt::Failed(err) => log::warn!("Watch on {collection} failed: {err}"),
            }

            let delay = self.backoff.next_delay();
            let retry_at = Instant::now() + delay;
            self.session.retry_count += 1;
            self.session.next_retry_at = Some(retry_at);
            self.transition(WatchStatus::Backoff);
            log::debug!(
                "Retry {} for {collection} in {delay:?}",
                self.session.retry_count
            );

            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep_until(retry_at) => {}
            }
        }
        self.transition(WatchStatus::Terminated);
        log::info!("Stopped watching {collection}");
    }

    async fn stream(&mut self, mut feed: S::Feed, shutdown: &CancellationToken) -> Interrupt {
        loop {
            let record = tokio::select! {
                biased;
                () = shutdown.cancelled() => return Interrupt::Shutdown,
                record = feed.next() => record,
            };
            match record {
                None => return Interrupt::Ended,
                Some(Err(err)) => return Interrupt::Failed(err),
                Some(Ok(WatchEvent::Added(object))) => self.forward(ChangeKind::Added, object),
                Some(Ok(WatchEvent::Modified(object))) => {
                    self.forward(ChangeKind::Modified, object)
                }
                Some(Ok(WatchEvent::Deleted(object))) => self.forward(ChangeKind::Deleted, object),
                Some(Ok(WatchEvent::Bookmark(_))) => {}
                Some(Ok(WatchEvent::Error(status))) => {
                    return Interrupt::Failed(SourceError::Api(status))
                }
            }
        }
    }

    fn forward(&self, change_kind: ChangeKind, object: DynamicObject) {
        match self.normalizer.normalize(change_kind, object) {
            Ok(event) => {
                log::info!(
                    "{} {} {}/{}: {}",
                    event.change_kind,
                    event.resource_kind,
                    event.namespace,
                    event.name,
                    event.message
                );
                self.hub.ingest(event);
            }
            Err(err) => log::warn!("Skipping malformed record: {err}"),
        }
    }

    fn transition(&mut self, status: WatchStatus) {
        log::trace!(
            "Watch status {:?} -> {status:?} (retry {}, next at {:?})",
            self.session.status,
            self.session.retry_count,
            self.session.next_retry_at
        );
        self.session.status = status;
        self.status.send_replace(status);
    }
}
