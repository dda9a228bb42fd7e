//! The client's background actor: owns the socket and runs the
//! `tokio::select!` loop that arbitrates inbound frames, outbound
//! commands, and the reconnect sequence.
//!
//! Grounded on `subxt`'s reconnecting RPC client `background_task`
//! (dispatch-or-reconnect `select!` over an `mpsc::UnboundedReceiver<Op>`
//! and a disconnect signal) and `ethers-rs`'s `ws-manager`
//! `RequestManager::reconnect`/`to_reissue` (re-subscribing everything
//! still registered, under its original id, after a fresh connection is
//! established).

use std::collections::HashMap;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::close_code;
use crate::engine::GraphQLError;
use crate::error::CloseEvent;
use crate::event::{ConnectionEvent, EventSource};
use crate::message::{self, ClientMessage, ServerMessage, SubscribePayload};
use crate::socket::{Connector, Socket, SocketEvent};

use super::{ClientConfig, Command, SubscriberMessage};

struct Registered {
    payload: SubscribePayload,
    sink: mpsc::UnboundedSender<SubscriberMessage>,
}

struct ConnectedSocket<S> {
    socket: S,
    events: BoxStream<'static, SocketEvent>,
}

/// Spawns the actor task for a freshly constructed [`super::Client`].
pub(crate) fn spawn<C: Connector>(
    config: ClientConfig<C>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: EventSource,
) {
    tokio::spawn(run(config, commands, events));
}

/// One thing that can make the actor loop proceed: a command from a
/// [`super::Client`]/[`super::Subscription`] handle, a frame or close event
/// from the socket, an idle-teardown deadline firing, or a keep-alive ping
/// due. Isolated into its own awaited step (rather than inlining
/// `tokio::select!` directly in `run`'s loop body) so the mutable borrow of
/// `socket` it needs ends as soon as the step completes, instead of
/// spanning the whole loop body the way a borrow taken inline would.
enum Step {
    Command(Option<Command>),
    Socket(Option<SocketEvent>),
    IdleTimedOut,
    PingDue,
}

async fn next_step<S: Socket>(
    commands: &mut mpsc::UnboundedReceiver<Command>,
    socket: &mut Option<ConnectedSocket<S>>,
    idle_deadline: Option<Duration>,
    ping_interval: Option<Duration>,
) -> Step {
    match socket {
        None => Step::Command(commands.recv().await),
        Some(cs) => {
            tokio::select! {
                biased;
                cmd = commands.recv() => Step::Command(cmd),
                event = cs.events.next() => Step::Socket(event),
                _ = sleep_or_pending(idle_deadline) => Step::IdleTimedOut,
                _ = sleep_or_pending(ping_interval) => Step::PingDue,
            }
        }
    }
}

async fn sleep_or_pending(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => futures::future::pending().await,
    }
}

async fn run<C: Connector>(
    config: ClientConfig<C>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: EventSource,
) {
    let mut subscribers: HashMap<String, Registered> = HashMap::new();
    let mut socket: Option<ConnectedSocket<C::Socket>> = None;

    if !config.lazy {
        match reconnect_with_retry(&config, &events).await {
            Ok(s) => socket = Some(s),
            Err(ReconnectFailure::ConfigRejected(close)) => {
                events.emit(&ConnectionEvent::Closed(close));
            }
            Err(ReconnectFailure::RetriesExhausted) => {
                events.emit(&ConnectionEvent::Closed(CloseEvent {
                    code: close_code::ABNORMAL_CLOSURE,
                    reason: "retry attempts exhausted".to_string(),
                    was_clean: false,
                }));
            }
        }
    }

    loop {
        let idle_deadline = (config.lazy && subscribers.is_empty() && socket.is_some())
            .then(|| config.idle_timeout.unwrap_or(Duration::ZERO));

        let step = next_step(
            &mut commands,
            &mut socket,
            idle_deadline,
            config.ping_interval,
        )
        .await;

        match step {
            Step::Command(None | Some(Command::Dispose)) => {
                if let Some(mut s) = socket.take() {
                    let _ = s
                        .socket
                        .close(close_code::NORMAL, "client disposed".to_string())
                        .await;
                }
                for (_, sub) in subscribers.drain() {
                    let _ = sub.sink.send(SubscriberMessage::Complete);
                }
                return;
            }
            Step::Command(Some(Command::Subscribe { id, payload, sink })) => {
                if subscribers.contains_key(&id) {
                    let _ = sink.send(SubscriberMessage::Error(vec![GraphQLError::new(format!(
                        "subscriber for {id} already exists"
                    ))]));
                    continue;
                }
                if socket.is_none() {
                    match reconnect_with_retry(&config, &events).await {
                        Ok(s) => socket = Some(s),
                        // Either retries were exhausted, or a `url`/
                        // `connection_params` producer rejected, before any
                        // socket could be established for this subscriber.
                        // It was never registered, so fail it directly
                        // rather than leaving it parked in `subscribers`
                        // with nothing left to ever terminate it.
                        Err(ReconnectFailure::ConfigRejected(close)) => {
                            let _ = sink.send(SubscriberMessage::Closed(close));
                            continue;
                        }
                        Err(ReconnectFailure::RetriesExhausted) => {
                            let _ = sink.send(SubscriberMessage::Closed(CloseEvent {
                                code: close_code::ABNORMAL_CLOSURE,
                                reason: "failed to establish connection".to_string(),
                                was_clean: false,
                            }));
                            continue;
                        }
                    }
                }
                let s = socket
                    .as_mut()
                    .expect("just connected above, or was already connected");
                send_frame(
                    s,
                    &events,
                    &ClientMessage::Subscribe {
                        id: id.clone(),
                        payload: payload.clone(),
                    },
                )
                .await;
                subscribers.insert(id, Registered { payload, sink });
            }
            Step::Command(Some(Command::Complete { id })) => {
                if subscribers.remove(&id).is_some() {
                    if let Some(s) = socket.as_mut() {
                        send_frame(s, &events, &ClientMessage::Complete { id }).await;
                    }
                }
            }
            Step::Socket(Some(SocketEvent::Open)) => {}
            Step::Socket(Some(SocketEvent::Message(frame))) => {
                events.emit(&ConnectionEvent::Message {
                    outbound: false,
                    frame: frame.clone(),
                });
                let s = socket
                    .as_mut()
                    .expect("Step::Socket only produced while a socket is connected");
                handle_server_frame(&frame, s, &events, &mut subscribers).await;
            }
            Step::Socket(other) => {
                let close = match other {
                    Some(SocketEvent::Close {
                        code,
                        reason,
                        was_clean,
                    }) => CloseEvent {
                        code,
                        reason,
                        was_clean,
                    },
                    _ => CloseEvent {
                        code: close_code::ABNORMAL_CLOSURE,
                        reason: String::new(),
                        was_clean: false,
                    },
                };
                socket = None;
                events.emit(&ConnectionEvent::Closed(close.clone()));

                if close_code::is_normal(close.code) {
                    for (_, sub) in subscribers.drain() {
                        let _ = sub.sink.send(SubscriberMessage::Complete);
                    }
                    return;
                }

                if close_code::is_terminal(close.code) {
                    fail_all(&mut subscribers, close);
                    return;
                }

                // 1005/1006: retryable. Reconnect and re-subscribe
                // everything still registered, under its original id, per
                // `ethers-rs`'s `to_reissue` pattern.
                match reconnect_with_retry(&config, &events).await {
                    Ok(mut s) => {
                        for (id, reg) in &subscribers {
                            send_frame(
                                &mut s,
                                &events,
                                &ClientMessage::Subscribe {
                                    id: id.clone(),
                                    payload: reg.payload.clone(),
                                },
                            )
                            .await;
                        }
                        socket = Some(s);
                    }
                    // Config-producer rejection has its own close reason;
                    // retry-budget exhaustion surfaces the last real close
                    // event observed on the socket, per `spec.md` §4.4.
                    Err(ReconnectFailure::ConfigRejected(rejected)) => {
                        fail_all(&mut subscribers, rejected);
                        return;
                    }
                    Err(ReconnectFailure::RetriesExhausted) => {
                        fail_all(&mut subscribers, close);
                        return;
                    }
                }
            }
            Step::IdleTimedOut => {
                if let Some(mut s) = socket.take() {
                    let _ = s
                        .socket
                        .close(close_code::NORMAL, "idle timeout".to_string())
                        .await;
                    events.emit(&ConnectionEvent::Closed(CloseEvent {
                        code: close_code::NORMAL,
                        reason: "idle timeout".to_string(),
                        was_clean: true,
                    }));
                }
            }
            Step::PingDue => {
                if let Some(s) = socket.as_mut() {
                    send_frame(
                        s,
                        &events,
                        &ClientMessage::Ping {
                            payload: serde_json::Value::Null,
                        },
                    )
                    .await;
                }
            }
        }
    }
}

async fn send_frame<S: Socket>(
    socket: &mut ConnectedSocket<S>,
    events: &EventSource,
    message: &ClientMessage,
) {
    let frame = message::encode_client_message(message);
    if socket.socket.send(frame.clone()).await.is_ok() {
        events.emit(&ConnectionEvent::Message {
            outbound: true,
            frame,
        });
    }
}

fn fail_all(subscribers: &mut HashMap<String, Registered>, close: CloseEvent) {
    for (_, sub) in subscribers.drain() {
        let _ = sub.sink.send(SubscriberMessage::Closed(close.clone()));
    }
}

async fn handle_server_frame<S: Socket>(
    frame: &str,
    socket: &mut ConnectedSocket<S>,
    events: &EventSource,
    subscribers: &mut HashMap<String, Registered>,
) {
    let msg = match message::decode_server_message(frame) {
        Ok(msg) => msg,
        Err(_) => return,
    };

    match msg {
        // Only arrives here if a second ack is sent after the handshake;
        // the initial ack is consumed by `connect_once`. Nothing to do.
        ServerMessage::ConnectionAck { .. } => {}
        ServerMessage::Ping { .. } => {
            send_frame(
                socket,
                events,
                &ClientMessage::Pong {
                    payload: serde_json::Value::Null,
                },
            )
            .await;
        }
        ServerMessage::Pong { .. } => {}
        ServerMessage::Next { id, payload } => {
            if let Some(sub) = subscribers.get(&id) {
                let _ = sub.sink.send(SubscriberMessage::Next(payload));
            }
        }
        ServerMessage::Error { id, payload } => {
            if let Some(sub) = subscribers.remove(&id) {
                let _ = sub.sink.send(SubscriberMessage::Error(payload));
            }
        }
        ServerMessage::Complete { id } => {
            if let Some(sub) = subscribers.remove(&id) {
                let _ = sub.sink.send(SubscriberMessage::Complete);
            }
        }
    }
}

/// Why [`reconnect_with_retry`] gave up. Distinguished so callers can
/// report the right close reason: a rejected `url`/`connection_params`
/// producer is terminal on the spot with its own reason (`spec.md` §4.4,
/// §7 "connectionParams producer rejection"), while exhausting the retry
/// budget on plain transport failures has no close event of its own —
/// callers that have one from a prior socket (a reconnect after an
/// abnormal close) should prefer reporting that one instead, per `spec.md`
/// §4.4 "surface the last close event as each subscriber's error".
enum ReconnectFailure {
    ConfigRejected(CloseEvent),
    RetriesExhausted,
}

/// One `connect_once` attempt's failure mode.
enum ConnectError {
    /// A `url`/`connection_params` producer rejected; not retried.
    ConfigRejected(String),
    /// A transport-level failure (connect, send, or no ack before the
    /// socket closed/errored); subject to the retry budget.
    Transport,
}

async fn reconnect_with_retry<C: Connector>(
    config: &ClientConfig<C>,
    events: &EventSource,
) -> Result<ConnectedSocket<C::Socket>, ReconnectFailure> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        events.emit(&ConnectionEvent::Connecting);

        match connect_once(config).await {
            Ok((connected, ack_payload)) => {
                events.emit(&ConnectionEvent::Connected { ack_payload });
                return Ok(connected);
            }
            Err(ConnectError::ConfigRejected(reason)) => {
                return Err(ReconnectFailure::ConfigRejected(CloseEvent {
                    code: close_code::BAD_REQUEST,
                    reason,
                    was_clean: true,
                }));
            }
            Err(ConnectError::Transport) if config.max_retries.is_some_and(|max| attempt > max) => {
                return Err(ReconnectFailure::RetriesExhausted);
            }
            Err(ConnectError::Transport) => {
                let delay = config.retry_policy.delay(attempt);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn connect_once<C: Connector>(
    config: &ClientConfig<C>,
) -> Result<(ConnectedSocket<C::Socket>, Option<serde_json::Value>), ConnectError> {
    let url = config
        .url
        .resolve()
        .await
        .map_err(ConnectError::ConfigRejected)?;
    let connection_params = config
        .connection_params
        .resolve()
        .await
        .map_err(ConnectError::ConfigRejected)?;

    let (mut socket, mut events) = config
        .connector
        .connect(&url)
        .await
        .map_err(|_| ConnectError::Transport)?;

    let init_frame = message::encode_client_message(&ClientMessage::ConnectionInit {
        payload: connection_params,
    });
    socket
        .send(init_frame)
        .await
        .map_err(|_| ConnectError::Transport)?;

    let ack = tokio::time::timeout(config.connection_ack_timeout, async {
        while let Some(event) = events.next().await {
            match &event {
                SocketEvent::Message(frame) => {
                    if let Ok(ServerMessage::ConnectionAck { payload }) =
                        message::decode_server_message(frame)
                    {
                        return Some(payload);
                    }
                    // Any other message before the ack is out of protocol;
                    // wait for the ack or the socket to close.
                }
                SocketEvent::Open => {}
                SocketEvent::Close { .. } | SocketEvent::Error(_) => return None,
            }
        }
        None
    })
    .await;

    match ack {
        Ok(Some(payload)) => Ok((ConnectedSocket { socket, events }, payload)),
        _ => Err(ConnectError::Transport),
    }
}
