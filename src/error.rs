//! The crate-wide error taxonomy (`spec.md` §7), carried as a typed enum
//! via `thiserror` rather than the `Box<dyn Error>`/string plumbing a
//! smaller embedded component might get away with — the ambient
//! error-handling stack this crate needs as a standalone, publishable
//! library (`SPEC_FULL.md` §1).

use crate::message::DecodeError;

/// A WebSocket transport failure reported by a [`crate::socket::Socket`]
/// implementation.
#[derive(Debug, thiserror::Error)]
#[error("socket error: {0}")]
pub struct SocketError(pub String);

impl SocketError {
    /// Wraps any displayable transport error.
    pub fn new(inner: impl std::fmt::Display) -> Self {
        Self(inner.to_string())
    }
}

/// The close event observed when a socket terminates, surfaced to sinks as
/// their terminal error per `spec.md` §6 "Client must surface the close
/// event ... as the error value delivered to sinks".
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("connection closed: code {code}, reason {reason:?}, clean: {was_clean}")]
pub struct CloseEvent {
    /// The WebSocket close code.
    pub code: u16,
    /// The close reason string, if any.
    pub reason: String,
    /// Whether the close handshake completed cleanly.
    pub was_clean: bool,
}

/// The top-level error type returned by fallible operations in this
/// crate that aren't scoped to one of the more specific error types
/// above (`DecodeError`, `SocketError`, `CloseEvent`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A frame failed structural validation (`spec.md` §4.1, §7 "Protocol
    /// violation").
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The underlying transport failed.
    #[error(transparent)]
    Socket(#[from] SocketError),

    /// The connection closed, possibly as the terminal event of a failed
    /// reconnection sequence.
    #[error(transparent)]
    Closed(#[from] CloseEvent),
}
