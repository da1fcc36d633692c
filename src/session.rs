//! Bridges one subscriber's outbound queue to a live transport.

use std::{fmt, sync::Arc, time::Duration};

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::hub::{Hub, Subscriber};

/// Upper bound on closing a transport during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportFailure {
    #[error("write failed: {0}")]
    Write(String),
    #[error("read failed: {0}")]
    Read(String),
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The hub released the subscriber, e.g. on shutdown.
    Released,
    /// The hub evicted the subscriber for overflowing its queue.
    Evicted,
    /// The remote end sent a close frame or hung up.
    RemoteClosed,
    Failed(TransportFailure),
    /// Aborted by the shutdown grace period, possibly mid-write.
    Forced,
}

/// One downstream connection.
///
/// `W` receives one text frame per event. `R` is only watched for the
/// remote end going away; inbound payloads are ignored.
pub struct Session<W, R> {
    hub: Arc<Hub>,
    subscriber: Arc<Subscriber>,
    writer: W,
    reader: R,
}

impl<W, R, E> Session<W, R>
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    /// Registers a new subscriber with `hub` for a connection whose handshake completed.
    pub fn new(hub: Arc<Hub>, writer: W, reader: R) -> Self {
        let subscriber = hub.register();
        Self {
            hub,
            subscriber,
            writer,
            reader,
        }
    }

    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    /// Runs until the transport fails, the remote closes, the hub releases or
    /// evicts the subscriber, or `force` is cancelled; then tears the session down.
    ///
    /// A release lets an in-flight write finish; eviction and `force` do not.
    pub async fn run(mut self, force: CancellationToken) -> SessionEnd {
        let id = self.subscriber.id();

        let end = tokio::select! {
            end = write_loop(&mut self.writer, &self.subscriber) => end,
            end = read_loop(&mut self.reader) => end,
            () = self.subscriber.evicted() => SessionEnd::Evicted,
            () = force.cancelled() => SessionEnd::Forced,
        };

        self.subscriber.begin_close();
        if end != SessionEnd::Forced {
            match tokio::time::timeout(CLOSE_TIMEOUT, self.writer.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log::debug!("Closing transport of {id} failed: {err}"),
                Err(_) => log::debug!("Closing transport of {id} timed out"),
            }
        }
        self.hub.unregister(id);
        self.subscriber.mark_closed();

        match &end {
            SessionEnd::Failed(failure) => log::warn!("Dropped {id}: {failure}"),
            SessionEnd::Released => log::info!("Released {id}"),
            SessionEnd::Evicted => log::warn!("Evicted {id}"),
            SessionEnd::RemoteClosed => log::info!("{id} disconnected"),
            SessionEnd::Forced => log::warn!("Forcibly closed {id}"),
        }
        end
    }
}

async fn write_loop<W>(writer: &mut W, subscriber: &Subscriber) -> SessionEnd
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    while let Some(event) = subscriber.next().await {
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("Skipping event that failed to encode: {err}");
                continue;
            }
        };
        if let Err(err) = writer.send(Message::Text(frame.into())).await {
            return SessionEnd::Failed(TransportFailure::Write(err.to_string()));
        }
    }
    SessionEnd::Released
}

async fn read_loop<R, E>(reader: &mut R) -> SessionEnd
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        match reader.next().await {
            None | Some(Ok(Message::Close(_))) => return SessionEnd::RemoteClosed,
            Some(Err(err)) => return SessionEnd::Failed(TransportFailure::Read(err.to_string())),
            Some(Ok(_)) => {}
        }
    }
}
