//! Integration tests for the client protocol engine (C4), driven entirely
//! through the public API against an in-process mock transport — a real
//! network socket can't be exercised without the toolchain, so
//! [`MockConnector`] plays the role of `spec.md` §6's `webSocketImpl`.
//!
//! Mirrors `spec.md` §8's concrete scenarios (S1-S6) and testable
//! properties (laws 1-8), adapted to what a single-process mock transport
//! can actually observe.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{StreamExt, FutureExt};
use serde_json::json;

use graphql_transport_ws::client::SubscriberMessage;
use graphql_transport_ws::close_code;
use graphql_transport_ws::engine::ExecutionResult;
use graphql_transport_ws::error::SocketError;
use graphql_transport_ws::message::{self, ClientMessage, ServerMessage, SubscribePayload};
use graphql_transport_ws::retry::FixedInterval;
use graphql_transport_ws::socket::{Connector, Socket, SocketEvent};
use graphql_transport_ws::{Client, ClientConfig};

/// The test's view of one connection the client established: the frames
/// the client sent (readable as it sends them) and a sender used to push
/// server frames or a close event back to the client.
struct MockHandles {
    outbox: mpsc_std::UnboundedReceiver<String>,
    events: mpsc_std::UnboundedSender<SocketEvent>,
}

// `futures::channel::mpsc` under a short alias so the struct fields above
// read cleanly next to the `tokio::sync::mpsc` the client itself uses
// internally (a different channel implementation, deliberately: the mock
// only needs to hand the client a `Stream`, which `futures::channel::mpsc`
// gives for free).
mod mpsc_std {
    pub use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
}

struct MockSocket {
    outbox: mpsc_std::UnboundedSender<String>,
}

impl Socket for MockSocket {
    async fn send(&mut self, frame: String) -> Result<(), SocketError> {
        self.outbox
            .unbounded_send(frame)
            .map_err(|e| SocketError::new(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: String) -> Result<(), SocketError> {
        let _ = self
            .outbox
            .unbounded_send(format!("__close__ code={code} reason={reason}"));
        Ok(())
    }
}

/// A scriptable [`Connector`]: each call to `connect` pops the next
/// scripted outcome (defaulting to success once the script is empty), and
/// on success, publishes a fresh [`MockHandles`] the test can retrieve via
/// [`MockConnector::next_handles`].
#[derive(Clone, Default)]
struct MockConnector {
    script: Arc<Mutex<VecDeque<bool>>>,
    pending_handles: Arc<Mutex<VecDeque<MockHandles>>>,
}

impl MockConnector {
    fn fail_next_connect(&self) {
        self.script.lock().unwrap().push_back(false);
    }

    /// Waits for the next connection attempt and returns its handles.
    /// Cooperatively yields to let the client's background actor task
    /// make progress, since the actor runs on the same current-thread
    /// runtime as the test.
    async fn next_handles(&self) -> MockHandles {
        for _ in 0..10_000 {
            if let Some(handles) = self.pending_handles.lock().unwrap().pop_front() {
                return handles;
            }
            tokio::task::yield_now().await;
        }
        panic!("no connection attempt observed");
    }
}

impl Connector for MockConnector {
    type Socket = MockSocket;

    async fn connect(
        &self,
        _url: &str,
    ) -> Result<(Self::Socket, BoxStream<'static, SocketEvent>), SocketError> {
        let succeed = self.script.lock().unwrap().pop_front().unwrap_or(true);
        if !succeed {
            return Err(SocketError::new("mock connect failure"));
        }

        let (outbox_tx, outbox_rx) = mpsc_std::unbounded();
        let (events_tx, events_rx) = mpsc_std::unbounded();
        self.pending_handles
            .lock()
            .unwrap()
            .push_back(MockHandles {
                outbox: outbox_rx,
                events: events_tx.clone(),
            });
        Ok((MockSocket { outbox: outbox_tx }, events_rx.boxed()))
    }
}

fn ack_frame() -> String {
    message::encode_server_message(&ServerMessage::ConnectionAck { payload: None })
}

fn send_ack(handles: &MockHandles) {
    handles
        .events
        .unbounded_send(SocketEvent::Message(ack_frame()))
        .unwrap();
}

/// Establishes the handshake for one connection attempt: waits for the
/// client to connect, then immediately acks it. Returns the handles so the
/// test can keep driving that connection.
async fn connect_and_ack(connector: &MockConnector) -> MockHandles {
    let handles = connector.next_handles().await;
    send_ack(&handles);
    handles
}

fn query_payload(query: &str) -> SubscribePayload {
    SubscribePayload {
        query: query.to_string(),
        ..Default::default()
    }
}

fn next_frame(handles: &mut MockHandles) -> Option<String> {
    handles.outbox.next().now_or_never().flatten()
}

/// S1 / law 3 (ack ordering): a query round-trips to exactly one `next`
/// then `complete`, and the client only ever dispatches `Subscribe` after
/// observing `ConnectionAck`.
#[tokio::test]
async fn query_round_trip_after_ack() {
    let connector = Arc::new(MockConnector::default());
    let client = Client::new(ClientConfig::new("wss://example.test/graphql", connector.clone()));

    let mut sub = client.subscribe(query_payload("{ getValue }"));
    let mut handles = connect_and_ack(&connector).await;

    // The Subscribe frame is only sent once the client has observed the ack.
    let frame = loop {
        if let Some(f) = next_frame(&mut handles) {
            break f;
        }
        tokio::task::yield_now().await;
    };
    let decoded = message::decode_client_message(&frame).unwrap();
    let id = match decoded {
        ClientMessage::Subscribe { id, payload } => {
            assert_eq!(payload.query, "{ getValue }");
            id
        }
        other => panic!("expected Subscribe, got {other:?}"),
    };

    let result = ExecutionResult {
        data: Some(json!({"getValue": "value"})),
        errors: vec![],
        extensions: None,
    };
    handles
        .events
        .unbounded_send(SocketEvent::Message(message::encode_server_message(
            &ServerMessage::Next {
                id: id.clone(),
                payload: result.clone(),
            },
        )))
        .unwrap();
    handles
        .events
        .unbounded_send(SocketEvent::Message(message::encode_server_message(
            &ServerMessage::Complete { id },
        )))
        .unwrap();

    assert_eq!(sub.next().await, Some(SubscriberMessage::Next(result)));
    assert_eq!(sub.next().await, Some(SubscriberMessage::Complete));
}

/// S2 / law 4 (id isolation): two concurrent subscribers never observe
/// each other's payloads.
#[tokio::test]
async fn two_subscribers_never_cross_deliver() {
    let connector = Arc::new(MockConnector::default());
    let client = Client::new(ClientConfig::new("wss://example.test/graphql", connector.clone()));

    let mut sub_a = client.subscribe_with_id("a".into(), query_payload("subscription { ping(key: \"1\") }"));
    let mut handles = connect_and_ack(&connector).await;
    let mut sub_b = client.subscribe_with_id("b".into(), query_payload("subscription { ping(key: \"2\") }"));

    // Let both Subscribe frames actually go out before the server reacts.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    handles
        .events
        .unbounded_send(SocketEvent::Message(message::encode_server_message(
            &ServerMessage::Next {
                id: "a".into(),
                payload: ExecutionResult {
                    data: Some(json!({"ping": "pong-a"})),
                    errors: vec![],
                    extensions: None,
                },
            },
        )))
        .unwrap();

    assert_eq!(
        sub_a.next().await,
        Some(SubscriberMessage::Next(ExecutionResult {
            data: Some(json!({"ping": "pong-a"})),
            errors: vec![],
            extensions: None,
        })),
    );
    // B's sink has nothing queued for it.
    assert_eq!(sub_b.next().now_or_never(), None);
}

/// S3 / law 5 (dispose quiescence): once `dispose` (or drop) runs, no
/// further frame for that id is ever delivered, even if it was already
/// in flight.
#[tokio::test]
async fn dispose_stops_delivery_even_for_in_flight_frames() {
    let connector = Arc::new(MockConnector::default());
    let client = Client::new(ClientConfig::new("wss://example.test/graphql", connector.clone()));

    let sub = client.subscribe_with_id("1".into(), query_payload("subscription { ping }"));
    let handles = connect_and_ack(&connector).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    sub.dispose();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    // A Complete frame for "1" should have gone to the server.
    let mut handles = handles;
    let mut saw_complete = false;
    while let Some(frame) = next_frame(&mut handles) {
        if let Ok(ClientMessage::Complete { id }) = message::decode_client_message(&frame) {
            assert_eq!(id, "1");
            saw_complete = true;
        }
    }
    assert!(saw_complete, "dispose should send Complete for its id");
}

/// S4 (adapted): a terminal close code never triggers a reconnect attempt
/// and is surfaced to the subscriber as a `Closed` error carrying the
/// close event's fields.
#[tokio::test]
async fn terminal_close_surfaces_to_subscriber_without_retry() {
    let connector = Arc::new(MockConnector::default());
    let client = Client::new(
        ClientConfig::new("wss://example.test/graphql", connector.clone())
            .with_max_retries(5),
    );

    let mut sub = client.subscribe(query_payload("subscription { ping }"));
    let handles = connect_and_ack(&connector).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    handles
        .events
        .unbounded_send(SocketEvent::Close {
            code: close_code::BAD_REQUEST,
            reason: "Welcome".to_string(),
            was_clean: true,
        })
        .unwrap();

    match sub.next().await {
        Some(SubscriberMessage::Closed(close)) => {
            assert_eq!(close.code, close_code::BAD_REQUEST);
            assert_eq!(close.reason, "Welcome");
            assert!(close.was_clean);
        }
        other => panic!("expected Closed, got {other:?}"),
    }

    // No reconnect attempt should have been made.
    assert!(connector.pending_handles.lock().unwrap().is_empty());
}

/// Law 7: terminal close codes make at most one connect attempt regardless
/// of `retryAttempts`, even when retries are otherwise unlimited.
#[tokio::test]
async fn terminal_close_does_not_retry_even_with_unlimited_retries() {
    let connector = Arc::new(MockConnector::default());
    let client = Client::new(
        ClientConfig::new("wss://example.test/graphql", connector.clone())
            .with_unlimited_retries(),
    );

    let mut sub = client.subscribe(query_payload("{ getValue }"));
    let handles = connect_and_ack(&connector).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    handles
        .events
        .unbounded_send(SocketEvent::Close {
            code: close_code::SUBSCRIBER_ALREADY_EXISTS,
            reason: "Subscriber for 1 already exists".to_string(),
            was_clean: true,
        })
        .unwrap();

    assert!(matches!(sub.next().await, Some(SubscriberMessage::Closed(_))));
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(connector.pending_handles.lock().unwrap().is_empty());
}

/// Law 2 (at-least-one-attempt) and the reconnect loop's own retry budget:
/// transient connect failures are retried until the connector finally
/// succeeds, all invisible to the subscriber.
#[tokio::test]
async fn recovers_after_transient_connect_failures() {
    let connector = Arc::new(MockConnector::default());
    connector.fail_next_connect();
    connector.fail_next_connect();
    let client = Client::new(
        ClientConfig::new("wss://example.test/graphql", connector.clone())
            .with_eager_connect()
            .with_retry_policy(Arc::new(FixedInterval(Duration::from_millis(1)))),
    );

    let mut handles = connect_and_ack(&connector).await;
    let mut sub = client.subscribe(query_payload("{ getValue }"));
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    let id = loop {
        if let Some(frame) = next_frame(&mut handles) {
            if let Ok(ClientMessage::Subscribe { id, .. }) = message::decode_client_message(&frame)
            {
                break id;
            }
        }
        tokio::task::yield_now().await;
    };
    handles
        .events
        .unbounded_send(SocketEvent::Message(message::encode_server_message(
            &ServerMessage::Next {
                id: id.clone(),
                payload: ExecutionResult {
                    data: Some(json!({"getValue": 1})),
                    errors: vec![],
                    extensions: None,
                },
            },
        )))
        .unwrap();

    assert_eq!(
        sub.next().await,
        Some(SubscriberMessage::Next(ExecutionResult {
            data: Some(json!({"getValue": 1})),
            errors: vec![],
            extensions: None,
        })),
    );
}

/// S5 (simplified): `max_retries = 0` makes an abnormal, non-terminal
/// close fail every subscriber immediately, without any reconnect
/// attempt — the `retryAttempts: 0` case of `spec.md` §4.4.
#[tokio::test]
async fn abnormal_close_with_no_retries_fails_immediately() {
    let connector = Arc::new(MockConnector::default());
    let client = Client::new(
        ClientConfig::new("wss://example.test/graphql", connector.clone())
            .with_max_retries(0)
            .with_retry_policy(Arc::new(FixedInterval(Duration::from_millis(1)))),
    );

    let mut sub = client.subscribe(query_payload("subscription { ping }"));
    let handles = connect_and_ack(&connector).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    handles
        .events
        .unbounded_send(SocketEvent::Close {
            code: 1006,
            reason: String::new(),
            was_clean: false,
        })
        .unwrap();

    match sub.next().await {
        Some(SubscriberMessage::Closed(close)) => assert_eq!(close.code, 1006),
        other => panic!("expected Closed, got {other:?}"),
    }
}

/// A lazy subscribe whose very first connection attempt never succeeds
/// (retries exhausted before any socket ever opened) must still surface a
/// terminal event to that subscriber, rather than leaving it parked
/// forever in the actor's registry with nothing left to ever terminate it.
#[tokio::test]
async fn lazy_subscribe_fails_when_initial_connect_retries_exhausted() {
    let connector = Arc::new(MockConnector::default());
    connector.fail_next_connect();
    connector.fail_next_connect();
    let client = Client::new(
        ClientConfig::new("wss://example.test/graphql", connector.clone())
            .with_max_retries(1)
            .with_retry_policy(Arc::new(FixedInterval(Duration::from_millis(1)))),
    );

    let mut sub = client.subscribe(query_payload("{ getValue }"));

    match sub.next().await {
        Some(SubscriberMessage::Closed(close)) => {
            assert_eq!(close.code, close_code::ABNORMAL_CLOSURE);
        }
        other => panic!("expected Closed, got {other:?}"),
    }
}

/// A `connectionParams` producer that rejects closes that connection
/// attempt with `4400` and the producer's own rejection message, without
/// ever touching the transport (`spec.md` §7 "connectionParams producer
/// rejection").
#[tokio::test]
async fn rejecting_connection_params_producer_closes_with_bad_request() {
    let connector = Arc::new(MockConnector::default());
    let client = Client::new(
        ClientConfig::new("wss://example.test/graphql", connector.clone())
            .with_connection_params_producer(|| {
                async { Err("not authorized".to_string()) }.boxed()
            }),
    );

    let mut sub = client.subscribe(query_payload("{ getValue }"));

    match sub.next().await {
        Some(SubscriberMessage::Closed(close)) => {
            assert_eq!(close.code, close_code::BAD_REQUEST);
            assert_eq!(close.reason, "not authorized");
        }
        other => panic!("expected Closed, got {other:?}"),
    }
}

/// Silent reconnect (law 6): an abnormal close followed by a successful
/// reconnect re-subscribes every still-registered subscriber under its
/// original id, with no spurious sink events from the reconnect itself.
#[tokio::test]
async fn reconnect_resubscribes_under_original_id() {
    let connector = Arc::new(MockConnector::default());
    let client = Client::new(
        ClientConfig::new("wss://example.test/graphql", connector.clone())
            .with_max_retries(3)
            .with_retry_policy(Arc::new(FixedInterval(Duration::from_millis(1)))),
    );

    let mut sub = client.subscribe_with_id("1".into(), query_payload("subscription { ping }"));
    let handles = connect_and_ack(&connector).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    handles
        .events
        .unbounded_send(SocketEvent::Close {
            code: 1006,
            reason: String::new(),
            was_clean: false,
        })
        .unwrap();

    // No sink event should arrive from the closure/reconnect itself.
    assert_eq!(sub.next().now_or_never(), None);

    let mut second = connect_and_ack(&connector).await;
    let resubscribe_id = loop {
        if let Some(frame) = next_frame(&mut second) {
            match message::decode_client_message(&frame) {
                Ok(ClientMessage::Subscribe { id, .. }) => break id,
                _ => continue,
            }
        }
        tokio::task::yield_now().await;
    };
    assert_eq!(resubscribe_id, "1");

    second
        .events
        .unbounded_send(SocketEvent::Message(message::encode_server_message(
            &ServerMessage::Next {
                id: "1".into(),
                payload: ExecutionResult {
                    data: Some(json!({"ping": 1})),
                    errors: vec![],
                    extensions: None,
                },
            },
        )))
        .unwrap();

    assert_eq!(
        sub.next().await,
        Some(SubscriberMessage::Next(ExecutionResult {
            data: Some(json!({"ping": 1})),
            errors: vec![],
            extensions: None,
        })),
    );
}

/// S6: in lazy mode, the socket stays open for the configured idle
/// timeout after the last subscriber disposes, then closes.
#[tokio::test(start_paused = true)]
async fn idle_timeout_closes_socket_after_last_dispose() {
    let connector = Arc::new(MockConnector::default());
    let client = Client::new(
        ClientConfig::new("wss://example.test/graphql", connector.clone())
            .with_idle_timeout(Duration::from_millis(20)),
    );

    let sub = client.subscribe(query_payload("{ getValue }"));
    let mut handles = connect_and_ack(&connector).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    sub.dispose();
    tokio::time::advance(Duration::from_millis(10)).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    // Not yet closed at T+10ms.
    assert!(next_frame(&mut handles)
        .map(|f| !f.starts_with("__close__"))
        .unwrap_or(true));

    tokio::time::advance(Duration::from_millis(15)).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    let saw_close = std::iter::from_fn(|| next_frame(&mut handles))
        .any(|f| f.starts_with("__close__"));
    assert!(saw_close, "socket should close once the idle timeout elapses");
}
