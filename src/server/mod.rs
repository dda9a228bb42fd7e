//! The server protocol engine (C3): a `Sink` of inbound frames and a
//! `Stream` of outbound reactions, per `spec.md` §4.3.
//!
//! Grounded directly on
//! `juniper_graphql_ws::graphql_transport_ws::{Connection, ConnectionState}`:
//! the same `PreInit`/`Active`/`Terminated` phase split (renamed
//! `AwaitingInit`/`Acknowledged`/`Closing` to match `spec.md`'s naming), the
//! same `SelectAll<BoxStream<Output>>` reaction multiplexer, and the same
//! oneshot-cancellation-by-drop trick for stopping a running operation. Two
//! things are deliberately not carried over:
//!
//! - The teacher's `SubscriptionStart` is a hand-rolled, `unsafe`,
//!   self-referential `Stream` impl, needed only because
//!   `juniper::resolve_into_stream` returns a future that borrows from the
//!   execution parameters it's passed. The [`crate::engine::ExecutionEngine`]
//!   seam here takes `&Self::Context` and returns an owned, `'static`
//!   stream, so there's nothing self-referential to build — plain
//!   `async`/`.await` suffices.
//! - The teacher infers query-vs-subscription by calling `juniper::execute`
//!   first and catching `GraphQLError::IsSubscription`. That relies on a
//!   juniper-specific error variant, so this module asks the engine via
//!   [`crate::engine::ExecutionEngine::operation_kind`] instead.

pub mod hooks;

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, Either};
use futures::stream::{self, BoxStream, SelectAll};
use futures::{FutureExt, Sink, Stream, StreamExt};

use crate::close_code;
use crate::engine::{ExecutionArgs, ExecutionEngine, GraphQLError, OperationKind};
use crate::message::{ClientMessage, ServerMessage, SubscribePayload};
use crate::registry::Registry;

pub use hooks::{ConnectResult, ConnectionConfig, Init, NoopHooks, OperationHooks};

/// Something the server can receive from its sink side: a decoded client
/// message, or notice that the underlying socket closed normally.
#[derive(Debug)]
pub enum Input {
    /// A decoded [`ClientMessage`].
    Message(ClientMessage),
    /// The socket closed without the client sending anything further;
    /// the connection should wind down with a normal closure.
    Close,
}

impl From<ClientMessage> for Input {
    fn from(msg: ClientMessage) -> Self {
        Self::Message(msg)
    }
}

/// One reaction a [`Connection`] produces in response to inbound input.
#[derive(Debug, PartialEq)]
pub enum Output {
    /// A message to serialize and send to the client.
    Message(ServerMessage),
    /// The connection should close with the given code and reason. Always
    /// the last item the `Connection` stream yields.
    Close {
        /// The WebSocket close code.
        code: u16,
        /// The human-readable close reason.
        message: String,
    },
}

impl Output {
    fn into_stream(self) -> BoxStream<'static, Self> {
        stream::once(future::ready(self)).boxed()
    }
}

/// An in-flight operation's cancellation handle, paired with a flag the
/// operation's own reaction stream flips the instant it emits its terminal
/// output (`Error` or `Complete`). Checking `done` rather than
/// `cancel.is_canceled()` lets [`Active::stoppers_prune`] see a
/// just-terminated id as free immediately, in the same poll that delivered
/// the terminal message to the caller — not a poll later, once something
/// happens to drop the receiver.
struct Stopper {
    cancel: oneshot::Sender<()>,
    done: Arc<AtomicBool>,
}

struct Active<E: ExecutionEngine> {
    engine: E,
    context: Arc<E::Context>,
    hooks: Arc<dyn OperationHooks<E>>,
    max_in_flight_operations: usize,
    stoppers: Registry<String, Stopper>,
}

enum ConnectionState<E: ExecutionEngine, I: Init<E>> {
    /// Waiting for `ConnectionInit`.
    AwaitingInit { init: I, engine: E },
    /// `ConnectionInit` was accepted; operations may run.
    Acknowledged(Active<E>),
    /// The connection is closing or closed; nothing more will be sent.
    Closing,
}

impl<E: ExecutionEngine, I: Init<E>> ConnectionState<E, I> {
    async fn handle_message(self, msg: ClientMessage) -> (Self, BoxStream<'static, Output>) {
        match self {
            Self::AwaitingInit { init, engine } => match msg {
                ClientMessage::ConnectionInit { payload } => match init.init(payload).await {
                    Ok(ConnectResult {
                        context,
                        ack_payload,
                        hooks,
                        max_in_flight_operations,
                        keep_alive_interval,
                    }) => {
                        let mut reactions = stream::iter(vec![Output::Message(
                            ServerMessage::ConnectionAck {
                                payload: ack_payload,
                            },
                        )])
                        .boxed();

                        if let Some(interval) = keep_alive_interval {
                            if interval > Duration::ZERO {
                                reactions = reactions
                                    .chain(stream::unfold((), move |()| async move {
                                        tokio::time::sleep(interval).await;
                                        Some((Output::Message(ServerMessage::Pong { payload: None }), ()))
                                    }))
                                    .boxed();
                            }
                        }

                        (
                            Self::Acknowledged(Active {
                                engine,
                                context: Arc::new(context),
                                hooks,
                                max_in_flight_operations,
                                stoppers: Registry::new(),
                            }),
                            reactions,
                        )
                    }
                    Err(reason) => (
                        Self::Closing,
                        Output::Close {
                            code: close_code::FORBIDDEN,
                            message: reason,
                        }
                        .into_stream(),
                    ),
                },
                // Any non-`ConnectionInit` frame before the handshake completes
                // is unauthorized, per `spec.md` §4.3 step 1.
                _ => (
                    Self::Closing,
                    Output::Close {
                        code: close_code::UNAUTHORIZED,
                        message: "Unauthorized".to_string(),
                    }
                    .into_stream(),
                ),
            },
            Self::Acknowledged(mut active) => {
                let reactions = match msg {
                    ClientMessage::ConnectionInit { .. } => {
                        return (
                            Self::Closing,
                            Output::Close {
                                code: close_code::TOO_MANY_INITIALISATION_REQUESTS,
                                message: "Too many initialisation requests".to_string(),
                            }
                            .into_stream(),
                        );
                    }
                    ClientMessage::Subscribe { id, payload } => {
                        active.stoppers_prune();
                        active.begin_subscribe(id, payload)
                    }
                    ClientMessage::Complete { id } => {
                        if let Some(stopper) = active.stoppers.remove(&id) {
                            // Dropping the sender resolves the matching
                            // receiver with `Err`, which the operation's
                            // interruptible stream treats the same as a
                            // value: stop immediately.
                            drop(stopper.cancel);
                            active.hooks.on_complete(&active.context, &id);
                        }
                        stream::empty().boxed()
                    }
                    ClientMessage::Ping { .. } => {
                        stream::iter(vec![Output::Message(ServerMessage::Pong { payload: None })])
                            .boxed()
                    }
                    ClientMessage::Pong { .. } => stream::empty().boxed(),
                };
                (Self::Acknowledged(active), reactions)
            }
            Self::Closing => (Self::Closing, stream::empty().boxed()),
        }
    }
}

impl<E: ExecutionEngine> Active<E> {
    /// Drops stoppers whose operation already ran to completion on its own
    /// (flagged `done` by its own reaction stream). Avoids letting a
    /// long-lived connection's registry grow unboundedly with dead
    /// entries, and frees the id up for immediate reuse.
    fn stoppers_prune(&mut self) {
        self.stoppers
            .retain(|_, stopper| !stopper.done.load(Ordering::SeqCst));
    }

    fn begin_subscribe(&mut self, id: String, payload: SubscribePayload) -> BoxStream<'static, Output> {
        if self.stoppers.contains(&id) {
            return Output::Close {
                code: close_code::SUBSCRIBER_ALREADY_EXISTS,
                message: format!("Subscriber for {id} already exists"),
            }
            .into_stream();
        }

        if self.max_in_flight_operations > 0 && self.stoppers.len() >= self.max_in_flight_operations
        {
            let mut errors = vec![GraphQLError::new("too many in-flight operations")];
            self.hooks.on_error(&self.context, &id, &mut errors);
            return stream::iter(vec![
                Output::Message(ServerMessage::Error {
                    id: id.clone(),
                    payload: errors,
                }),
                Output::Message(ServerMessage::Complete { id }),
            ])
            .boxed();
        }

        let (tx, rx) = oneshot::channel::<()>();
        let done = Arc::new(AtomicBool::new(false));
        let _ = self.stoppers.add(
            id.clone(),
            Stopper {
                cancel: tx,
                done: done.clone(),
            },
        );

        let args = self
            .hooks
            .on_subscribe(&self.context, &id, &payload)
            .unwrap_or_else(|| ExecutionArgs {
                query: payload.query,
                operation_name: payload.operation_name,
                variables: payload.variables,
                extensions: payload.extensions,
            });

        let s = run_operation(id.clone(), self.engine.clone(), self.context.clone(), self.hooks.clone(), args)
            .flatten_stream()
            .boxed();

        let s = stream::unfold((rx, s), |(rx, mut s)| async move {
            match future::select(rx, s.next()).await {
                Either::Left(_) => None,
                Either::Right((item, rx)) => item.map(|v| (v, (rx, s))),
            }
        })
        .boxed();

        // A setup failure (§4.3 step 3: `onSubscribe`/validation/resolver
        // setup failing before any `Next`) surfaces as a single `Error`
        // item from `run_operation` and nothing else. Flag that as soon as
        // it's observed, in the same poll that hands the item to the
        // caller, so `done` is already true by the time anything could act
        // on it — and skip the trailing `Complete` below for it, since
        // §3's invariant is exactly one terminal message per operation.
        let saw_setup_error = Arc::new(AtomicBool::new(false));
        let saw_setup_error2 = saw_setup_error.clone();
        let done2 = done.clone();
        let s = s
            .map(move |item| {
                if matches!(item, Output::Message(ServerMessage::Error { .. })) {
                    saw_setup_error2.store(true, Ordering::SeqCst);
                    done2.store(true, Ordering::SeqCst);
                }
                item
            })
            .boxed();

        let hooks = self.hooks.clone();
        let context = self.context.clone();
        let id_for_complete = id.clone();
        s.chain(
            stream::once(async move {
                if saw_setup_error.load(Ordering::SeqCst) {
                    None
                } else {
                    done.store(true, Ordering::SeqCst);
                    hooks.on_complete(&context, &id_for_complete);
                    Some(Output::Message(ServerMessage::Complete { id: id_for_complete }))
                }
            })
            .filter_map(future::ready),
        )
        .boxed()
    }
}

trait FlattenStream {
    fn flatten_stream(self) -> BoxStream<'static, Output>;
}

impl FlattenStream for BoxFuture<'static, BoxStream<'static, Output>> {
    fn flatten_stream(self) -> BoxStream<'static, Output> {
        self.into_stream().flatten().boxed()
    }
}

fn run_operation<E: ExecutionEngine>(
    id: String,
    engine: E,
    context: Arc<E::Context>,
    hooks: Arc<dyn OperationHooks<E>>,
    args: ExecutionArgs,
) -> BoxFuture<'static, BoxStream<'static, Output>> {
    async move {
        match engine.operation_kind(&args) {
            OperationKind::Query => match engine.execute(&context, args).await {
                Ok(mut result) => {
                    hooks.on_next(&context, &id, &mut result);
                    stream::iter(vec![Output::Message(ServerMessage::Next { id, payload: result })])
                        .boxed()
                }
                Err(e) => {
                    let mut errors = vec![GraphQLError::new(e.to_string())];
                    hooks.on_error(&context, &id, &mut errors);
                    stream::iter(vec![Output::Message(ServerMessage::Error { id, payload: errors })])
                        .boxed()
                }
            },
            OperationKind::Subscription => match engine.subscribe(&context, args).await {
                Ok(events) => {
                    let context2 = context.clone();
                    let hooks2 = hooks.clone();
                    let id2 = id.clone();
                    events
                        .map(move |item| match item {
                            Ok(mut result) => {
                                hooks2.on_next(&context2, &id2, &mut result);
                                Output::Message(ServerMessage::Next {
                                    id: id2.clone(),
                                    payload: result,
                                })
                            }
                            Err(e) => Output::Close {
                                code: close_code::INTERNAL_ERROR,
                                message: e.to_string(),
                            },
                        })
                        .boxed()
                }
                Err(e) => {
                    let mut errors = vec![GraphQLError::new(e.to_string())];
                    hooks.on_error(&context, &id, &mut errors);
                    stream::iter(vec![Output::Message(ServerMessage::Error { id, payload: errors })])
                        .boxed()
                }
            },
        }
    }
    .boxed()
}

enum SinkState<E: ExecutionEngine, I: Init<E>> {
    Ready(ConnectionState<E, I>),
    Handling(BoxFuture<'static, (ConnectionState<E, I>, BoxStream<'static, Output>)>),
    Closed,
}

/// A server-side `graphql-transport-ws` connection: a `Sink` for inbound
/// [`Input`] and a `Stream` of outbound [`Output`], independent of any
/// particular transport.
pub struct Connection<E: ExecutionEngine, I: Init<E>> {
    reactions: SelectAll<BoxStream<'static, Output>>,
    stream_waker: Option<Waker>,
    stream_terminated: bool,
    sink_state: SinkState<E, I>,
    acked: Arc<AtomicBool>,
}

impl<E: ExecutionEngine, I: Init<E> + Send> Connection<E, I> {
    /// Starts a new connection, waiting at most `connection_init_wait_timeout`
    /// for `ConnectionInit` before closing with
    /// [`close_code::CONNECTION_INIT_TIMEOUT`], per `spec.md` §4.3 step 1.
    ///
    /// Pass `Duration::ZERO` to disable the handshake timeout.
    pub fn new(engine: E, init: I, connection_init_wait_timeout: Duration) -> Self {
        let acked = Arc::new(AtomicBool::new(false));
        let mut reactions: SelectAll<BoxStream<'static, Output>> = SelectAll::new();

        if connection_init_wait_timeout > Duration::ZERO {
            let acked = acked.clone();
            reactions.push(
                stream::once(async move {
                    tokio::time::sleep(connection_init_wait_timeout).await;
                    if acked.load(Ordering::SeqCst) {
                        None
                    } else {
                        Some(Output::Close {
                            code: close_code::CONNECTION_INIT_TIMEOUT,
                            message: "Connection initialisation timeout".to_string(),
                        })
                    }
                })
                .filter_map(future::ready)
                .boxed(),
            );
        }

        Self {
            reactions,
            stream_waker: None,
            stream_terminated: false,
            sink_state: SinkState::Ready(ConnectionState::AwaitingInit { init, engine }),
            acked,
        }
    }

    fn poll_sink(mut self: Pin<&mut Self>, cx: &mut TaskContext) -> Poll<Result<(), &'static str>> {
        match &mut self.sink_state {
            SinkState::Ready(_) => Poll::Ready(Ok(())),
            SinkState::Handling(result) => match Pin::new(result).poll(cx) {
                Poll::Ready((state, reactions)) => {
                    if matches!(state, ConnectionState::Acknowledged(_)) {
                        self.acked.store(true, Ordering::SeqCst);
                    }
                    self.reactions.push(reactions);
                    self.sink_state = SinkState::Ready(state);
                    if let Some(waker) = self.stream_waker.take() {
                        waker.wake();
                    }
                    Poll::Ready(Ok(()))
                }
                Poll::Pending => Poll::Pending,
            },
            SinkState::Closed => Poll::Ready(Err("polled after close")),
        }
    }
}

impl<E, I> Sink<Input> for Connection<E, I>
where
    E: ExecutionEngine,
    I: Init<E> + Send,
{
    type Error = Infallible;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut TaskContext) -> Poll<Result<(), Self::Error>> {
        self.poll_sink(cx)
            .map_err(|e| panic!("`Connection::poll_ready()`: {e}"))
    }

    fn start_send(self: Pin<&mut Self>, item: Input) -> Result<(), Self::Error> {
        let this = self.get_mut();
        let state = &mut this.sink_state;
        *state = match std::mem::replace(state, SinkState::Closed) {
            SinkState::Ready(state) => match item {
                Input::Message(msg) => SinkState::Handling(state.handle_message(msg).boxed()),
                Input::Close => {
                    this.reactions.push(
                        Output::Close {
                            code: close_code::NORMAL,
                            message: "Normal Closure".to_string(),
                        }
                        .into_stream(),
                    );
                    SinkState::Closed
                }
            },
            SinkState::Handling(_) | SinkState::Closed => {
                panic!("`Connection::start_send()`: called when not ready")
            }
        };
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext) -> Poll<Result<(), Self::Error>> {
        self.poll_sink(cx).map(|_| Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut TaskContext) -> Poll<Result<(), Self::Error>> {
        self.sink_state = SinkState::Closed;
        if let Some(waker) = self.stream_waker.take() {
            waker.wake();
        }
        Poll::Ready(Ok(()))
    }
}

impl<E, I> Stream for Connection<E, I>
where
    E: ExecutionEngine,
    I: Init<E>,
{
    type Item = Output;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext) -> Poll<Option<Self::Item>> {
        self.stream_waker = Some(cx.waker().clone());

        if self.stream_terminated {
            return Poll::Ready(None);
        }

        if !self.reactions.is_empty() {
            match Pin::new(&mut self.reactions).poll_next(cx) {
                Poll::Ready(Some(Output::Close { code, message })) => {
                    self.stream_terminated = true;
                    return Poll::Ready(Some(Output::Close { code, message }));
                }
                Poll::Ready(Some(reaction)) => return Poll::Ready(Some(reaction)),
                Poll::Ready(None) => {
                    self.reactions = SelectAll::new();
                }
                Poll::Pending => (),
            }
        }

        if let SinkState::Closed = self.sink_state {
            return Poll::Ready(None);
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use futures::channel::mpsc;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value as Json};

    use super::*;
    use crate::engine::ExecutionResult;

    #[derive(Debug, Clone, thiserror::Error)]
    #[error("{0}")]
    struct TestError(String);

    #[derive(Default)]
    struct TestEngineState {
        results: HashMap<String, Result<ExecutionResult, TestError>>,
        subs: HashMap<String, mpsc::UnboundedReceiver<Result<ExecutionResult, TestError>>>,
    }

    /// A stand-in [`ExecutionEngine`] whose `execute`/`subscribe` outcomes
    /// are configured per test, keyed by the query text of the operation
    /// under test. Subscriptions are driven by pushing items into a channel
    /// obtained from [`TestEngine::subscription_sender`] before the
    /// `Subscribe` frame that triggers it is sent.
    #[derive(Clone, Default)]
    struct TestEngine {
        state: Arc<Mutex<TestEngineState>>,
    }

    impl TestEngine {
        fn set_result(&self, query: &str, result: Result<ExecutionResult, TestError>) {
            self.state
                .lock()
                .unwrap()
                .results
                .insert(query.to_string(), result);
        }

        fn subscription_sender(
            &self,
            query: &str,
        ) -> mpsc::UnboundedSender<Result<ExecutionResult, TestError>> {
            let (tx, rx) = mpsc::unbounded();
            self.state.lock().unwrap().subs.insert(query.to_string(), rx);
            tx
        }
    }

    impl ExecutionEngine for TestEngine {
        type Context = ();
        type Error = TestError;

        fn operation_kind(&self, args: &ExecutionArgs) -> OperationKind {
            if args.query.starts_with("subscription") {
                OperationKind::Subscription
            } else {
                OperationKind::Query
            }
        }

        async fn execute(&self, _context: &(), args: ExecutionArgs) -> Result<ExecutionResult, TestError> {
            self.state
                .lock()
                .unwrap()
                .results
                .remove(&args.query)
                .unwrap_or_else(|| Err(TestError(format!("no result configured for {}", args.query))))
        }

        async fn subscribe(
            &self,
            _context: &(),
            args: ExecutionArgs,
        ) -> Result<BoxStream<'static, Result<ExecutionResult, TestError>>, TestError> {
            self.state
                .lock()
                .unwrap()
                .subs
                .remove(&args.query)
                .map(|rx| rx.boxed())
                .ok_or_else(|| TestError(format!("no subscription configured for {}", args.query)))
        }
    }

    struct TestInit {
        result: Result<ConnectResult<TestEngine>, String>,
    }

    impl Init<TestEngine> for TestInit {
        async fn init(self, _payload: Json) -> Result<ConnectResult<TestEngine>, String> {
            self.result
        }
    }

    fn accepting_init() -> TestInit {
        TestInit {
            result: Ok(ConnectResult {
                context: (),
                ack_payload: None,
                hooks: Arc::new(NoopHooks),
                max_in_flight_operations: 0,
                keep_alive_interval: None,
            }),
        }
    }

    fn subscribe(id: &str, query: &str) -> Input {
        Input::Message(ClientMessage::Subscribe {
            id: id.to_string(),
            payload: SubscribePayload {
                query: query.to_string(),
                ..Default::default()
            },
        })
    }

    async fn acknowledged(engine: TestEngine) -> Connection<TestEngine, TestInit> {
        let mut conn = Connection::new(engine, accepting_init(), Duration::ZERO);
        conn.send(Input::Message(ClientMessage::ConnectionInit { payload: Json::Null }))
            .await
            .unwrap();
        assert_eq!(
            conn.next().await,
            Some(Output::Message(ServerMessage::ConnectionAck { payload: None })),
        );
        conn
    }

    #[tokio::test]
    async fn acks_after_connection_init() {
        let mut conn = Connection::new(TestEngine::default(), accepting_init(), Duration::ZERO);
        conn.send(Input::Message(ClientMessage::ConnectionInit { payload: Json::Null }))
            .await
            .unwrap();
        assert_eq!(
            conn.next().await,
            Some(Output::Message(ServerMessage::ConnectionAck { payload: None })),
        );
    }

    #[tokio::test]
    async fn non_init_frame_before_ack_is_unauthorized() {
        let mut conn = Connection::new(TestEngine::default(), accepting_init(), Duration::ZERO);
        conn.send(subscribe("1", "{ getValue }")).await.unwrap();
        assert_eq!(
            conn.next().await,
            Some(Output::Close {
                code: close_code::UNAUTHORIZED,
                message: "Unauthorized".to_string(),
            }),
        );
        assert_eq!(conn.next().await, None);
    }

    #[tokio::test]
    async fn on_connect_rejection_closes_forbidden_with_reason() {
        let init = TestInit {
            result: Err("Welcome".to_string()),
        };
        let mut conn = Connection::new(TestEngine::default(), init, Duration::ZERO);
        conn.send(Input::Message(ClientMessage::ConnectionInit { payload: Json::Null }))
            .await
            .unwrap();
        assert_eq!(
            conn.next().await,
            Some(Output::Close {
                code: close_code::FORBIDDEN,
                message: "Welcome".to_string(),
            }),
        );
        assert_eq!(conn.next().await, None);
    }

    #[tokio::test]
    async fn second_connection_init_is_too_many_requests() {
        let mut conn = acknowledged(TestEngine::default()).await;
        conn.send(Input::Message(ClientMessage::ConnectionInit { payload: Json::Null }))
            .await
            .unwrap();
        assert_eq!(
            conn.next().await,
            Some(Output::Close {
                code: close_code::TOO_MANY_INITIALISATION_REQUESTS,
                message: "Too many initialisation requests".to_string(),
            }),
        );
    }

    /// S1: a query round-trips as exactly one `Next` then `Complete`.
    #[tokio::test]
    async fn query_round_trip() {
        let engine = TestEngine::default();
        engine.set_result(
            "{ getValue }",
            Ok(ExecutionResult {
                data: Some(json!({"getValue": "value"})),
                errors: vec![],
                extensions: None,
            }),
        );
        let mut conn = acknowledged(engine).await;
        conn.send(subscribe("1", "{ getValue }")).await.unwrap();

        assert_eq!(
            conn.next().await,
            Some(Output::Message(ServerMessage::Next {
                id: "1".to_string(),
                payload: ExecutionResult {
                    data: Some(json!({"getValue": "value"})),
                    errors: vec![],
                    extensions: None,
                },
            })),
        );
        assert_eq!(
            conn.next().await,
            Some(Output::Message(ServerMessage::Complete { id: "1".to_string() })),
        );
    }

    #[tokio::test]
    async fn execute_error_yields_error_frame_and_removes_id() {
        let engine = TestEngine::default();
        engine.set_result("bogus", Err(TestError("boom".to_string())));
        engine.set_result("{ getValue }", Ok(ExecutionResult::default()));
        let mut conn = acknowledged(engine).await;
        conn.send(subscribe("1", "bogus")).await.unwrap();

        assert_eq!(
            conn.next().await,
            Some(Output::Message(ServerMessage::Error {
                id: "1".to_string(),
                payload: vec![GraphQLError::new("boom")],
            })),
        );

        // The id was removed: re-subscribing under it is accepted rather
        // than hitting the duplicate-id close.
        conn.send(subscribe("1", "{ getValue }")).await.unwrap();
        assert_eq!(
            conn.next().await,
            Some(Output::Message(ServerMessage::Next {
                id: "1".to_string(),
                payload: ExecutionResult::default(),
            })),
        );
    }

    #[tokio::test]
    async fn duplicate_subscribe_id_closes_4409() {
        let engine = TestEngine::default();
        let _tx = engine.subscription_sender("subscription { ping }");
        let mut conn = acknowledged(engine).await;
        conn.send(subscribe("1", "subscription { ping }")).await.unwrap();
        conn.send(subscribe("1", "subscription { ping }")).await.unwrap();

        assert_eq!(
            conn.next().await,
            Some(Output::Close {
                code: close_code::SUBSCRIBER_ALREADY_EXISTS,
                message: "Subscriber for 1 already exists".to_string(),
            }),
        );
    }

    /// S2: two active subscriptions never cross-deliver each other's
    /// payloads.
    #[tokio::test]
    async fn two_subscriptions_demux_by_id() {
        let engine = TestEngine::default();
        let tx_a = engine.subscription_sender("subscription { ping(key: \"1\") }");
        let _tx_b = engine.subscription_sender("subscription { ping(key: \"2\") }");
        let mut conn = acknowledged(engine).await;

        conn.send(subscribe("a", "subscription { ping(key: \"1\") }"))
            .await
            .unwrap();
        conn.send(subscribe("b", "subscription { ping(key: \"2\") }"))
            .await
            .unwrap();

        tx_a.unbounded_send(Ok(ExecutionResult {
            data: Some(json!({"ping": "pong"})),
            errors: vec![],
            extensions: None,
        }))
        .unwrap();

        assert_eq!(
            conn.next().await,
            Some(Output::Message(ServerMessage::Next {
                id: "a".to_string(),
                payload: ExecutionResult {
                    data: Some(json!({"ping": "pong"})),
                    errors: vec![],
                    extensions: None,
                },
            })),
        );
    }

    /// S3: a client-initiated `Complete` stops the operation, and any
    /// events that race in afterward are never delivered.
    #[tokio::test]
    async fn client_complete_stops_delivery_even_if_events_race_in() {
        let engine = TestEngine::default();
        let tx = engine.subscription_sender("subscription { ping }");
        let mut conn = acknowledged(engine).await;
        conn.send(subscribe("1", "subscription { ping }")).await.unwrap();

        tx.unbounded_send(Ok(ExecutionResult {
            data: Some(json!({"ping": 1})),
            errors: vec![],
            extensions: None,
        }))
        .unwrap();
        assert_eq!(
            conn.next().await,
            Some(Output::Message(ServerMessage::Next {
                id: "1".to_string(),
                payload: ExecutionResult {
                    data: Some(json!({"ping": 1})),
                    errors: vec![],
                    extensions: None,
                },
            })),
        );

        conn.send(Input::Message(ClientMessage::Complete { id: "1".to_string() }))
            .await
            .unwrap();

        // A further event racing in after dispose must never surface.
        let _ = tx.unbounded_send(Ok(ExecutionResult {
            data: Some(json!({"ping": 2})),
            errors: vec![],
            extensions: None,
        }));
        drop(tx);

        assert_eq!(conn.next().now_or_never(), None);
    }

    #[tokio::test]
    async fn unknown_id_on_complete_is_ignored() {
        let mut conn = acknowledged(TestEngine::default()).await;
        conn.send(Input::Message(ClientMessage::Complete {
            id: "never-subscribed".to_string(),
        }))
        .await
        .unwrap();
        assert_eq!(conn.next().now_or_never(), None);
    }

    /// An engine-raised error from the stream itself closes the whole
    /// socket with `1011`, per `spec.md` §4.3 step 5, rather than just
    /// failing the one operation.
    #[tokio::test]
    async fn engine_stream_error_closes_1011() {
        let engine = TestEngine::default();
        let tx = engine.subscription_sender("subscription { ping }");
        let mut conn = acknowledged(engine).await;
        conn.send(subscribe("1", "subscription { ping }")).await.unwrap();

        tx.unbounded_send(Err(TestError("resolver panicked".to_string())))
            .unwrap();

        assert_eq!(
            conn.next().await,
            Some(Output::Close {
                code: close_code::INTERNAL_ERROR,
                message: "resolver panicked".to_string(),
            }),
        );
        assert_eq!(conn.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_timeout_closes_4408() {
        let mut conn = Connection::new(
            TestEngine::default(),
            accepting_init(),
            Duration::from_millis(50),
        );
        tokio::time::advance(Duration::from_millis(51)).await;
        assert_eq!(
            conn.next().await,
            Some(Output::Close {
                code: close_code::CONNECTION_INIT_TIMEOUT,
                message: "Connection initialisation timeout".to_string(),
            }),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connection_init_before_timeout_cancels_it() {
        let mut conn = Connection::new(
            TestEngine::default(),
            accepting_init(),
            Duration::from_millis(50),
        );
        conn.send(Input::Message(ClientMessage::ConnectionInit { payload: Json::Null }))
            .await
            .unwrap();
        assert_eq!(
            conn.next().await,
            Some(Output::Message(ServerMessage::ConnectionAck { payload: None })),
        );
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(conn.next().now_or_never(), None);
    }
}
