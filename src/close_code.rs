//! WebSocket close codes that carry protocol-level meaning.
//!
//! These are the codes enumerated in the subprotocol's external interface:
//! some are reserved by RFC 6455 itself (`NORMAL`, `INTERNAL_ERROR`), the
//! rest live in the private-use range `4000..=4999` and are specific to
//! `graphql-transport-ws`.

/// Normal closure. Either peer may send this; the client never retries
/// after observing it.
pub const NORMAL: u16 = 1000;

/// The endpoint is going away (e.g. server shutdown, browser tab closing).
/// Treated as a normal closure for retry purposes.
pub const GOING_AWAY: u16 = 1001;

/// Protocol error at the WebSocket framing layer. Terminal: the client does
/// not retry.
pub const PROTOCOL_ERROR: u16 = 1002;

/// No status code was present in the close frame. Dual-natured per
/// `spec.md` §9's open question: terminal once retries are exhausted, but
/// retryable while attempts remain. See `DESIGN.md` for the resolution.
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// Abnormal closure (no close frame received at all). Retryable.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// An unexpected error occurred while executing an operation. Always
/// initiated by the server; terminal for the client.
pub const INTERNAL_ERROR: u16 = 1011;

/// The received frame failed structural validation.
pub const BAD_REQUEST: u16 = 4400;

/// A data-carrying frame was received before `ConnectionAck`.
pub const UNAUTHORIZED: u16 = 4401;

/// `onConnect` rejected the connection.
pub const FORBIDDEN: u16 = 4403;

/// `ConnectionInit` was not received within `connection_init_wait_timeout`.
pub const CONNECTION_INIT_TIMEOUT: u16 = 4408;

/// A `Subscribe` was received for an id that is already active.
pub const SUBSCRIBER_ALREADY_EXISTS: u16 = 4409;

/// More than one `ConnectionInit` was received on the same socket.
pub const TOO_MANY_INITIALISATION_REQUESTS: u16 = 4429;

/// Returns `true` if a client observing this close code must not attempt to
/// reconnect, per `spec.md` §4.4 "Reconnection" and §8 law 7.
///
/// `NO_STATUS_RECEIVED` (1005) is deliberately *not* included here: whether
/// it is terminal depends on whether retries remain, which this function
/// cannot see. Callers consult `is_terminal` only for codes where the
/// answer doesn't depend on retry-budget state; `client::actor` handles
/// 1005 separately.
pub fn is_terminal(code: u16) -> bool {
    matches!(
        code,
        PROTOCOL_ERROR
            | INTERNAL_ERROR
            | BAD_REQUEST
            | UNAUTHORIZED
            | SUBSCRIBER_ALREADY_EXISTS
            | TOO_MANY_INITIALISATION_REQUESTS
            | FORBIDDEN
            | CONNECTION_INIT_TIMEOUT
    )
}

/// Returns `true` if this close code represents a clean, expected shutdown
/// that should never trigger a reconnect attempt.
pub fn is_normal(code: u16) -> bool {
    matches!(code, NORMAL | GOING_AWAY)
}
