//! Registry behaviour with observers, memberships and topic fan-out

mod common;

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

use common::{eventually, init_tracing, session};
use tether_core::{
    Body, ConnectionId, Envelope, RegistryConfig, RegistryError, SessionRef, TetherError, TopicId,
    UserId,
};
use tether_server::{
    ChannelSink, CloseReason, ConnectionRegistry, MembershipLoader, SessionObserver, SinkMessage,
    StaticMemberships,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Opened(SessionRef),
    Closed(SessionRef),
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<Event>>,
}

impl RecordingObserver {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl SessionObserver for RecordingObserver {
    fn session_opened(&self, session: SessionRef) {
        self.events.lock().unwrap().push(Event::Opened(session));
    }

    fn session_closed(&self, session: SessionRef) {
        self.events.lock().unwrap().push(Event::Closed(session));
    }
}

struct Fixture {
    registry: ConnectionRegistry,
    observer: Arc<RecordingObserver>,
    memberships: Arc<StaticMemberships>,
}

fn fixture() -> Fixture {
    let observer = Arc::new(RecordingObserver::default());
    let memberships = Arc::new(StaticMemberships::new());
    let as_observer: Arc<dyn SessionObserver> = observer.clone();
    let as_loader: Arc<dyn MembershipLoader> = memberships.clone();
    let registry = ConnectionRegistry::with_collaborators(
        RegistryConfig::default(),
        Some(as_observer),
        Some(as_loader),
    );
    Fixture {
        registry,
        observer,
        memberships,
    }
}

fn connect(
    registry: &ConnectionRegistry,
    who: SessionRef,
) -> (ConnectionId, UnboundedReceiver<SinkMessage>) {
    let (sink, rx) = ChannelSink::new();
    let id = registry.add_connection(Arc::new(sink));
    registry.authenticate_connection(id, who).unwrap();
    (id, rx)
}

fn drain_frames(rx: &mut UnboundedReceiver<SinkMessage>) -> Vec<Envelope> {
    let mut frames = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let SinkMessage::Frame(bytes) = message {
            frames.push(Envelope::decode(&bytes).unwrap());
        }
    }
    frames
}

#[tokio::test]
async fn test_observer_sees_open_and_close() {
    init_tracing();
    let f = fixture();
    let alice = session(1, 10);

    let (id, _rx) = connect(&f.registry, alice);
    assert!(f.registry.remove_connection(id, CloseReason::ClientClosed));
    assert!(!f.registry.remove_connection(id, CloseReason::ClientClosed));

    assert_eq!(
        f.observer.events(),
        vec![Event::Opened(alice), Event::Closed(alice)]
    );
}

#[tokio::test]
async fn test_connection_binds_to_one_session_only() {
    init_tracing();
    let f = fixture();
    let alice = session(1, 10);
    let bob = session(2, 20);

    let (id, mut rx) = connect(&f.registry, alice);
    let error = f.registry.authenticate_connection(id, bob).unwrap_err();
    assert!(matches!(
        error,
        TetherError::Registry(RegistryError::AlreadyAuthenticated { connection_id }) if connection_id == id
    ));

    assert_eq!(f.registry.session_of(id), Some(alice));
    assert_eq!(f.registry.user_connections(alice.user_id), vec![id]);
    assert!(f.registry.user_connections(bob.user_id).is_empty());
    assert_eq!(f.registry.authenticated_user_count(), 1);

    let ping = Envelope::new(1, Body::ConnectionOpen);
    assert_eq!(f.registry.send_to_user(alice.user_id, &ping).unwrap(), 1);
    assert_eq!(f.registry.send_to_user(bob.user_id, &ping).unwrap(), 0);
    assert_eq!(drain_frames(&mut rx).len(), 1);

    assert!(f.registry.remove_connection(id, CloseReason::ClientClosed));
    assert_eq!(f.registry.authenticated_user_count(), 0);
    assert!(f.registry.user_connections(alice.user_id).is_empty());
    assert_eq!(
        f.observer.events(),
        vec![Event::Opened(alice), Event::Closed(alice)]
    );
}

#[tokio::test]
async fn test_unauthenticated_close_not_observed() {
    let f = fixture();
    let (sink, _rx) = ChannelSink::new();
    let id = f.registry.add_connection(Arc::new(sink));
    assert!(f.registry.close_connection(id, CloseReason::Error));
    assert!(f.observer.events().is_empty());
}

#[tokio::test]
async fn test_logout_closes_only_that_session() {
    init_tracing();
    let f = fixture();
    let phone = session(1, 10);
    let laptop = session(1, 11);

    let (_, mut phone_a) = connect(&f.registry, phone);
    let (_, mut phone_b) = connect(&f.registry, phone);
    let (laptop_id, _laptop_rx) = connect(&f.registry, laptop);

    assert_eq!(f.registry.session_logged_out(phone), 2);

    for rx in [&mut phone_a, &mut phone_b] {
        assert_eq!(
            rx.try_recv().unwrap(),
            SinkMessage::Close(CloseReason::LoggedOut)
        );
    }
    assert_eq!(f.registry.user_connections(UserId::new(1)), vec![laptop_id]);
    assert_eq!(f.registry.sessions_of_user(UserId::new(1)), vec![laptop.session_id]);

    // Logged-out sessions skip presence re-evaluation
    let closed = f
        .observer
        .events()
        .into_iter()
        .filter(|event| matches!(event, Event::Closed(_)))
        .count();
    assert_eq!(closed, 0);
}

#[tokio::test]
async fn test_memberships_loaded_once_per_user() {
    init_tracing();
    let f = fixture();
    let user = UserId::new(1);
    let topic = TopicId::new(7);
    f.memberships.set(user, vec![topic]);

    let (first, _rx1) = connect(&f.registry, session(1, 10));
    eventually("topic subscription", || {
        f.registry.topic_subscribers(topic) == vec![user]
    })
    .await;

    // A second device does not reload
    let (_second, _rx2) = connect(&f.registry, session(1, 11));
    f.registry.remove_connection(first, CloseReason::ClientClosed);
    f.registry.close_all(CloseReason::ServerShutdown);

    // Reconnecting after every socket closed uses the cache
    let (_third, _rx3) = connect(&f.registry, session(1, 12));
    assert_eq!(f.registry.topic_subscribers(topic), vec![user]);
    assert_eq!(f.memberships.loads(), 1);
}

#[tokio::test]
async fn test_publish_reaches_live_subscribers() {
    init_tracing();
    let f = fixture();
    let topic = TopicId::new(3);
    let alice = UserId::new(1);
    let bob = UserId::new(2);
    f.memberships.set(alice, vec![topic]);
    f.memberships.set(bob, vec![topic]);

    let (_, mut alice_rx) = connect(&f.registry, session(1, 10));
    let (bob_id, mut bob_rx) = connect(&f.registry, session(2, 20));
    eventually("both subscribed", || {
        f.registry.topic_subscribers(topic).len() == 2
    })
    .await;

    let envelope = Envelope::new(
        1,
        Body::Updates {
            payload: b"first".to_vec(),
        },
    );
    assert_eq!(f.registry.publish_to_topic(topic, &envelope).unwrap(), 2);
    assert_eq!(drain_frames(&mut alice_rx), vec![envelope.clone()]);
    assert_eq!(drain_frames(&mut bob_rx), vec![envelope]);

    // Subscriptions outlive sockets but fan-out only reaches live ones
    f.registry.remove_connection(bob_id, CloseReason::ClientClosed);
    let second = Envelope::new(
        2,
        Body::Updates {
            payload: b"second".to_vec(),
        },
    );
    assert_eq!(f.registry.publish_to_topic(topic, &second).unwrap(), 1);
    assert_eq!(drain_frames(&mut alice_rx), vec![second]);

    f.registry.unsubscribe_from_topic(alice, topic);
    assert_eq!(f.registry.topic_subscribers(topic), vec![bob]);
}
