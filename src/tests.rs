use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::extract::ws::Message;
use chrono::NaiveDateTime;
use futures::{
    channel::mpsc,
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use k8s_openapi::api::core::v1::Event as CoreEvent;
use kube_core::{ApiResource, DynamicObject, ErrorResponse, WatchEvent};
use parking_lot::Mutex;
use serde_json::json;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    event::{ChangeKind, TIMESTAMP_FORMAT},
    hub::{Hub, HubConfig, Subscriber, SubscriberState},
    normalize::Normalizer,
    session::{Session, SessionEnd},
    source::{RawChangeRecord, Selector, SourceError, WatchSource},
    supervisor::{BackoffConfig, Supervisor, WatchStatus},
};

type ScriptedFeed = BoxStream<'static, Result<RawChangeRecord, SourceError>>;

/// A scripted upstream. Each start consumes the next scripted feed or failure;
/// without scripts left, feeds stay open and empty.
#[derive(Clone, Default)]
pub(crate) struct FakeSource {
    scripts: Arc<Mutex<VecDeque<Result<ScriptedFeed, SourceError>>>>,
    starts: Arc<AtomicUsize>,
}

impl FakeSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A feed that yields `records` and then stays open.
    pub(crate) fn push_feed(&self, records: Vec<Result<RawChangeRecord, SourceError>>) {
        let feed = stream::iter(records).chain(stream::pending()).boxed();
        self.scripts.lock().push_back(Ok(feed));
    }

    /// A feed that yields whatever is sent on the returned channel.
    pub(crate) fn push_live_feed(
        &self,
    ) -> mpsc::UnboundedSender<Result<RawChangeRecord, SourceError>> {
        let (records, feed) = mpsc::unbounded();
        self.scripts
            .lock()
            .push_back(Ok(feed.chain(stream::pending()).boxed()));
        records
    }

    pub(crate) fn fail_start(&self, status: ErrorResponse) {
        self.scripts
            .lock()
            .push_back(Err(SourceError::List(kube_client::Error::Api(status))));
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl WatchSource for FakeSource {
    type Feed = ScriptedFeed;

    async fn start_watch(&self, _selector: &Selector) -> Result<Self::Feed, SourceError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().pop_front();
        script.unwrap_or_else(|| Ok(stream::pending().boxed()))
    }
}

pub(crate) fn api_error(code: u16) -> ErrorResponse {
    ErrorResponse {
        status: "Failure".into(),
        message: format!("injected failure {code}"),
        reason: "InternalError".into(),
        code,
    }
}

/// A `v1/Event` about `kind` `namespace/name`.
pub(crate) fn core_event(kind: &str, namespace: &str, name: &str, message: &str) -> DynamicObject {
    DynamicObject::new(
        &format!("{name}.event"),
        &ApiResource::erase::<CoreEvent>(&()),
    )
    .within(namespace)
    .data(json!({
        "involvedObject": {"kind": kind, "namespace": namespace, "name": name},
        "message": message,
    }))
}

pub(crate) fn pod_added(name: &str) -> Result<RawChangeRecord, SourceError> {
    Ok(WatchEvent::Added(core_event("Pod", "ns", name, "")))
}

struct Relay {
    hub: Arc<Hub>,
    status: watch::Receiver<WatchStatus>,
    shutdown: CancellationToken,
    watch: JoinHandle<()>,
}

impl Relay {
    fn start(source: &FakeSource, hub: Arc<Hub>) -> Self {
        let supervisor = Supervisor::new(
            source.clone(),
            Selector::core_events(),
            Arc::clone(&hub),
            &BackoffConfig {
                min: Duration::from_millis(100),
                max: Duration::from_secs(1),
            },
        );
        let status = supervisor.status();
        let shutdown = CancellationToken::new();
        let watch = tokio::spawn(supervisor.run(shutdown.clone()));
        Self {
            hub,
            status,
            shutdown,
            watch,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.watch.await.unwrap();
        assert_eq!(*self.status.borrow(), WatchStatus::Terminated);
        self.hub.close_all();
    }
}

struct Client<F> {
    frames: F,
    subscriber: Arc<Subscriber>,
    session: JoinHandle<SessionEnd>,
}

impl<F: Stream<Item = Message> + Unpin> Client<F> {
    async fn frame(&mut self) -> Option<serde_json::Value> {
        let message = tokio::time::timeout(Duration::from_secs(5), self.frames.next())
            .await
            .expect("no frame arrived")?;
        match message {
            Message::Text(text) => Some(serde_json::from_str(text.as_str()).unwrap()),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    async fn names(&mut self, count: usize) -> Vec<String> {
        let mut names = Vec::new();
        for _ in 0..count {
            let frame = self.frame().await.expect("transport closed");
            names.push(frame["object"]["name"].as_str().unwrap().to_owned());
        }
        names
    }

    async fn assert_silent(&mut self) {
        let next = tokio::time::timeout(Duration::from_secs(2), self.frames.next()).await;
        assert!(next.is_err(), "unexpected frame: {next:?}");
    }
}

fn connect(hub: &Arc<Hub>) -> Client<mpsc::UnboundedReceiver<Message>> {
    let (writer, frames) = mpsc::unbounded::<Message>();
    spawn_session(hub, writer, frames)
}

/// A subscriber whose transport accepts one frame and then never drains.
fn connect_stalled(hub: &Arc<Hub>) -> Client<mpsc::Receiver<Message>> {
    let (writer, frames) = mpsc::channel::<Message>(0);
    spawn_session(hub, writer, frames)
}

fn spawn_session<W, F>(hub: &Arc<Hub>, writer: W, frames: F) -> Client<F>
where
    W: futures::Sink<Message> + Unpin + Send + 'static,
    W::Error: std::fmt::Display + Send,
{
    let session = Session::new(
        Arc::clone(hub),
        writer,
        stream::pending::<Result<Message, io::Error>>(),
    );
    let subscriber = Arc::clone(session.subscriber());
    Client {
        frames,
        subscriber,
        session: tokio::spawn(session.run(CancellationToken::new())),
    }
}

#[tokio::test(start_paused = true)]
async fn added_record_reaches_subscriber_as_one_frame() {
    let source = FakeSource::new();
    source.push_feed(vec![Ok(WatchEvent::Added(core_event(
        "Pod",
        "ns",
        "foo",
        "Scheduled",
    )))]);
    let hub = Arc::new(Hub::default());
    let mut client = connect(&hub);
    let relay = Relay::start(&source, Arc::clone(&hub));

    let frame = client.frame().await.unwrap();
    assert_eq!(frame["type"], "ADDED");
    assert_eq!(
        frame["object"],
        json!({"kind": "Pod", "namespace": "ns", "name": "foo", "message": "Scheduled"})
    );
    let timestamp = frame["timestamp"].as_str().unwrap();
    assert!(NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).is_ok());
    client.assert_silent().await;

    relay.stop().await;
    assert_eq!(client.session.await.unwrap(), SessionEnd::Released);
}

#[tokio::test(start_paused = true)]
async fn every_subscriber_sees_every_event_in_order() {
    let source = FakeSource::new();
    source.push_feed(vec![pod_added("e1"), pod_added("e2"), pod_added("e3")]);
    let hub = Arc::new(Hub::default());
    let mut first = connect(&hub);
    let mut second = connect(&hub);
    let relay = Relay::start(&source, Arc::clone(&hub));

    assert_eq!(first.names(3).await, ["e1", "e2", "e3"]);
    assert_eq!(second.names(3).await, ["e1", "e2", "e3"]);

    relay.stop().await;
}

#[tokio::test(start_paused = true)]
async fn restart_after_failure_does_not_replay() {
    let source = FakeSource::new();
    source.push_feed(vec![
        pod_added("e1"),
        Err(SourceError::Stream(kube_client::Error::Api(api_error(500)))),
    ]);
    source.push_feed(vec![pod_added("e2")]);
    let hub = Arc::new(Hub::default());
    let mut client = connect(&hub);
    let mut relay = Relay::start(&source, Arc::clone(&hub));

    assert_eq!(client.names(2).await, ["e1", "e2"]);
    client.assert_silent().await;
    assert_eq!(source.starts(), 2);
    relay
        .status
        .wait_for(|status| *status == WatchStatus::Streaming)
        .await
        .unwrap();

    relay.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stalled_subscriber_is_evicted_without_affecting_others() {
    let hub = Arc::new(Hub::new(HubConfig {
        queue_capacity: 2,
        eviction_threshold: 3,
    }));
    let mut stalled = connect_stalled(&hub);
    let mut healthy = connect(&hub);

    let normalizer = Normalizer::for_resource(&ApiResource::erase::<CoreEvent>(&()));
    let pod = |name: &str| {
        normalizer
            .normalize(ChangeKind::Added, core_event("Pod", "ns", name, ""))
            .unwrap()
    };

    // Let the stalled session take e1 and block writing it.
    hub.ingest(pod("e1"));
    while stalled.subscriber.pending() > 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(healthy.names(1).await, ["e1"]);

    for name in ["e2", "e3", "e4", "e5"] {
        hub.ingest(pod(name));
        assert_eq!(healthy.names(1).await, [name]);
    }
    // e2..e5 went to a queue of two: two overflows so far.
    assert!(hub.contains(stalled.subscriber.id()));
    assert_eq!(stalled.subscriber.pending(), 2);

    hub.ingest(pod("e6"));
    assert_eq!(healthy.names(1).await, ["e6"]);

    assert_eq!(
        (&mut stalled.session).await.unwrap(),
        SessionEnd::Evicted
    );
    assert!(!hub.contains(stalled.subscriber.id()));
    assert_eq!(stalled.subscriber.state(), SubscriberState::Closed);
    // Only the frame taken before the stall was handed to the transport, which is now closed.
    assert_eq!(stalled.frame().await.unwrap()["object"]["name"], "e1");
    assert!(stalled.frame().await.is_none());

    assert!(hub.contains(healthy.subscriber.id()));
}

#[tokio::test(start_paused = true)]
async fn blocked_transport_does_not_delay_others() {
    let source = FakeSource::new();
    let names: Vec<String> = (0..50).map(|i| format!("pod-{i}")).collect();
    source.push_feed(names.iter().map(|name| pod_added(name)).collect());
    let hub = Arc::new(Hub::default());
    let _stalled = connect_stalled(&hub);
    let mut healthy = connect(&hub);
    let relay = Relay::start(&source, Arc::clone(&hub));

    assert_eq!(healthy.names(50).await, names);

    relay.stop().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_sessions() {
    let source = FakeSource::new();
    let hub = Arc::new(Hub::default());
    let clients: Vec<_> = (0..3).map(|_| connect(&hub)).collect();
    let relay = Relay::start(&source, Arc::clone(&hub));

    relay.stop().await;

    assert!(hub.is_empty());
    for mut client in clients {
        assert!(client.frame().await.is_none());
        assert_eq!(client.session.await.unwrap(), SessionEnd::Released);
        assert_eq!(client.subscriber.state(), SubscriberState::Closed);
    }
}
